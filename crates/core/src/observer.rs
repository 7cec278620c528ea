use std::sync::{Arc, Mutex, MutexGuard, Weak};

struct Registry<L: ?Sized> {
    next_id: u64,
    listeners: Vec<(u64, Arc<L>)>,
}

/// Listener registry; notification runs outside the lock so listeners may re-enter.
pub struct Observers<L: ?Sized> {
    registry: Arc<Mutex<Registry<L>>>,
}

impl<L: ?Sized + Send + Sync + 'static> Observers<L> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, listener: Arc<L>) -> Subscription {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push((id, listener));
            id
        };

        let weak: Weak<Mutex<Registry<L>>> = Arc::downgrade(&self.registry);
        Subscription {
            release: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry)
                        .listeners
                        .retain(|(listener_id, _)| *listener_id != id);
                }
            })),
        }
    }

    pub fn notify(&self, mut deliver: impl FnMut(&L)) {
        let listeners = lock(&self.registry)
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect::<Vec<_>>();
        for listener in listeners {
            deliver(&listener);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.registry).listeners.clear();
    }
}

impl<L: ?Sized + Send + Sync + 'static> Default for Observers<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a listener registered; dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes the listener"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// Leaves the listener registered for the registry's lifetime.
    pub fn detach(mut self) {
        self.release = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    trait Ping: Send + Sync {
        fn ping(&self);
    }

    impl<F> Ping for F
    where
        F: Fn() + Send + Sync,
    {
        fn ping(&self) {
            self()
        }
    }

    #[test]
    fn dropping_the_subscription_unsubscribes() {
        let observers = Observers::<dyn Ping>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let subscription = observers.subscribe(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        observers.notify(|listener| listener.ping());
        drop(subscription);
        observers.notify(|listener| listener.ping());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(observers.is_empty());
    }

    #[test]
    fn detached_listeners_stay_registered() {
        let observers = Observers::<dyn Ping>::new();
        observers.subscribe(Arc::new(|| {})).detach();
        assert_eq!(observers.len(), 1);
    }
}
