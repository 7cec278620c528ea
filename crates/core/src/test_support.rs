use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use arbor_storage::{
    BatchWriter, BoxFuture, ConversationId, ConversationRecord, ConversationStore, FolderId,
    FolderRecord, FolderStore, MemoryStorage, MessageId, MessageRecord, MessageStore,
    StorageError, StorageResult, WriteBatch,
};
use tokio::sync::Notify;

use crate::service::{ConversationService, ServiceConfig};

/// Memory gateway that records every attempted batch and can be told to fail.
#[derive(Default)]
pub(crate) struct FlakyStorage {
    inner: MemoryStorage,
    fail_commits: AtomicBool,
    failing_pings: AtomicU32,
    pings: AtomicU32,
    batches: Mutex<Vec<WriteBatch>>,
    read_gate: Mutex<Option<ReadGate>>,
}

/// Holds one `list_messages` call until released.
#[derive(Clone, Default)]
pub(crate) struct ReadGate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl ReadGate {
    pub(crate) async fn entered(&self) {
        self.entered.notified().await;
    }

    pub(crate) fn release(&self) {
        self.release.notify_one();
    }
}

impl FlakyStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inner(&self) -> &MemoryStorage {
        &self.inner
    }

    pub(crate) fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_pings(&self, count: u32) {
        self.failing_pings.store(count, Ordering::SeqCst);
    }

    pub(crate) fn ping_count(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    pub(crate) fn hold_next_message_read(&self) -> ReadGate {
        let gate = ReadGate::default();
        *self.read_gate.lock().expect("gate lock") = Some(gate.clone());
        gate
    }

    pub(crate) fn batches(&self) -> Vec<WriteBatch> {
        self.batches.lock().expect("batches lock").clone()
    }
}

impl ConversationStore for FlakyStorage {
    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        self.inner.get_conversation(conversation_id)
    }

    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        self.inner.list_conversations()
    }
}

impl MessageStore for FlakyStorage {
    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
        self.inner.get_message(message_id)
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        let gate = self.read_gate.lock().expect("gate lock").take();
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            self.inner.list_messages(conversation_id).await
        })
    }
}

impl FolderStore for FlakyStorage {
    fn get_folder(&self, folder_id: FolderId) -> BoxFuture<'_, StorageResult<Option<FolderRecord>>> {
        self.inner.get_folder(folder_id)
    }

    fn list_folders(&self) -> BoxFuture<'_, StorageResult<Vec<FolderRecord>>> {
        self.inner.list_folders()
    }
}

impl BatchWriter for FlakyStorage {
    fn ping(&self) -> BoxFuture<'_, StorageResult<()>> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_pings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        Box::pin(async move {
            if failing {
                return Err(StorageError::InvariantViolation {
                    stage: "flaky-ping",
                    details: "storage is still starting".to_string(),
                });
            }
            Ok(())
        })
    }

    fn commit(&self, batch: WriteBatch) -> BoxFuture<'_, StorageResult<()>> {
        self.batches.lock().expect("batches lock").push(batch.clone());
        if self.fail_commits.load(Ordering::SeqCst) {
            return Box::pin(async {
                Err(StorageError::InvariantViolation {
                    stage: "flaky-commit",
                    details: "injected write failure".to_string(),
                })
            });
        }
        self.inner.commit(batch)
    }
}

pub(crate) async fn ready_service() -> (Arc<ConversationService>, Arc<FlakyStorage>) {
    let storage = Arc::new(FlakyStorage::new());
    let service = Arc::new(ConversationService::new(
        storage.clone(),
        ServiceConfig::default(),
    ));
    service.initialize().await.expect("service initializes");
    (service, storage)
}
