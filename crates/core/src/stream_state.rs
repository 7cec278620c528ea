use crate::message::{ConversationId, StreamSessionId};

/// Routing key for one streaming session; events carrying another key are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub conversation_id: ConversationId,
    pub session_id: StreamSessionId,
}

impl StreamTarget {
    pub const fn new(conversation_id: ConversationId, session_id: StreamSessionId) -> Self {
        Self {
            conversation_id,
            session_id,
        }
    }
}

/// Coarse view of a conversation's session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming,
    Committing,
    Cancelling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming(StreamTarget),
    Committing(StreamTarget),
    Cancelling(StreamTarget),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamTarget),
    /// The provider finished; the response is being saved.
    Complete(StreamTarget),
    Cancel(StreamTarget),
    /// Commit finished, the stream failed, or cancellation cleanup is done.
    Settle(StreamTarget),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyActive {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveStream,
    SessionMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    /// The session has already left `Streaming`.
    NotStreaming { phase: StreamPhase },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    pub fn phase(&self) -> StreamPhase {
        match self {
            Self::Idle => StreamPhase::Idle,
            Self::Streaming(_) => StreamPhase::Streaming,
            Self::Committing(_) => StreamPhase::Committing,
            Self::Cancelling(_) => StreamPhase::Cancelling,
        }
    }

    pub fn active_target(&self) -> Option<StreamTarget> {
        match self {
            Self::Streaming(target) | Self::Committing(target) | Self::Cancelling(target) => {
                Some(*target)
            }
            Self::Idle => None,
        }
    }

    /// Only the live `Streaming` session may feed deltas into the tree.
    pub fn accepts_stream_event(&self, target: StreamTarget) -> bool {
        matches!(self, Self::Streaming(active) if *active == target)
    }

    /// Applies one transition; every transition except `Start` must name the active session.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(target) => self.apply_start(target),
            StreamTransition::Complete(target) => {
                self.leave_streaming(target).map(|_| Self::Committing(target))
            }
            StreamTransition::Cancel(target) => {
                self.leave_streaming(target).map(|_| Self::Cancelling(target))
            }
            StreamTransition::Settle(target) => self.apply_settle(target),
        }
    }

    fn apply_start(&self, target: StreamTarget) -> StreamTransitionResult {
        match self.active_target() {
            Some(active) => Err(StreamTransitionRejection::AlreadyActive {
                active,
                attempted: target,
            }),
            None => Ok(Self::Streaming(target)),
        }
    }

    fn leave_streaming(&self, target: StreamTarget) -> Result<(), StreamTransitionRejection> {
        match self {
            Self::Streaming(active) if *active == target => Ok(()),
            Self::Idle => Err(StreamTransitionRejection::NoActiveStream),
            Self::Streaming(active) | Self::Committing(active) | Self::Cancelling(active)
                if *active != target =>
            {
                Err(StreamTransitionRejection::SessionMismatch {
                    active: *active,
                    attempted: target,
                })
            }
            other => Err(StreamTransitionRejection::NotStreaming {
                phase: other.phase(),
            }),
        }
    }

    fn apply_settle(&self, target: StreamTarget) -> StreamTransitionResult {
        match self.active_target() {
            Some(active) if active == target => Ok(Self::Idle),
            Some(active) => Err(StreamTransitionRejection::SessionMismatch {
                active,
                attempted: target,
            }),
            None => Err(StreamTransitionRejection::NoActiveStream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(session: u64) -> StreamTarget {
        StreamTarget::new(ConversationId::new_v7(), StreamSessionId::new(session))
    }

    #[test]
    fn start_only_from_idle() {
        let first = target(1);
        let second = StreamTarget::new(first.conversation_id, StreamSessionId::new(2));
        let streaming = StreamState::Idle
            .apply(StreamTransition::Start(first))
            .expect("starts");

        assert_eq!(streaming.phase(), StreamPhase::Streaming);
        assert_eq!(
            streaming.apply(StreamTransition::Start(second)),
            Err(StreamTransitionRejection::AlreadyActive {
                active: first,
                attempted: second,
            })
        );
    }

    #[test]
    fn stale_targets_are_rejected() {
        let live = target(2);
        let stale = StreamTarget::new(live.conversation_id, StreamSessionId::new(1));
        let state = StreamState::Streaming(live);

        assert!(state.accepts_stream_event(live));
        assert!(!state.accepts_stream_event(stale));
        assert!(matches!(
            state.apply(StreamTransition::Complete(stale)),
            Err(StreamTransitionRejection::SessionMismatch { .. })
        ));
        assert!(matches!(
            state.apply(StreamTransition::Settle(stale)),
            Err(StreamTransitionRejection::SessionMismatch { .. })
        ));
    }

    #[test]
    fn cancel_loses_to_an_in_progress_commit() {
        let live = target(3);
        let committing = StreamState::Streaming(live)
            .apply(StreamTransition::Complete(live))
            .expect("completes");

        assert_eq!(
            committing.apply(StreamTransition::Cancel(live)),
            Err(StreamTransitionRejection::NotStreaming {
                phase: StreamPhase::Committing,
            })
        );
        assert!(!committing.accepts_stream_event(live));
        assert_eq!(
            committing.apply(StreamTransition::Settle(live)),
            Ok(StreamState::Idle)
        );
    }

    #[test]
    fn completion_after_cancel_is_rejected() {
        let live = target(4);
        let cancelling = StreamState::Streaming(live)
            .apply(StreamTransition::Cancel(live))
            .expect("cancels");

        assert_eq!(cancelling.phase(), StreamPhase::Cancelling);
        assert_eq!(
            cancelling.apply(StreamTransition::Complete(live)),
            Err(StreamTransitionRejection::NotStreaming {
                phase: StreamPhase::Cancelling,
            })
        );
        assert_eq!(
            StreamState::Idle.apply(StreamTransition::Cancel(live)),
            Err(StreamTransitionRejection::NoActiveStream)
        );
    }
}
