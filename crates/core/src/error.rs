use arbor_llm::ProviderError;
use arbor_storage::{ConversationId, StorageError};
use snafu::Snafu;

use crate::message::Message;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("{entity} '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("invalid state at `{stage}`: {details}"))]
    InvalidState {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("storage failed on `{stage}`, {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to encode message content"))]
    EncodeContent {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("message '{id}' has unreadable content"))]
    DecodeContent {
        stage: &'static str,
        id: String,
        source: serde_json::Error,
    },
    #[snafu(display("conversation '{conversation_id}' already has an active stream"))]
    ConcurrentStream {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("provider failed on `{stage}`, {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("provider stream failed: {details}"))]
    ProviderStream {
        stage: &'static str,
        details: String,
    },
    /// The response finished but could not be saved; `message` carries it for a retry.
    #[snafu(display("response was generated but not saved, {source}"))]
    UnsavedResponse {
        stage: &'static str,
        message: Box<Message>,
        source: StorageError,
    },
}

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Storage,
    ConcurrentStream,
    Provider,
    UnsavedResponse,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Storage { source, .. } if source.is_not_found() => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Storage { .. } | Self::EncodeContent { .. } | Self::DecodeContent { .. } => {
                ErrorKind::Storage
            }
            Self::ConcurrentStream { .. } => ErrorKind::ConcurrentStream,
            Self::Provider { .. } | Self::ProviderStream { .. } => ErrorKind::Provider,
            Self::UnsavedResponse { .. } => ErrorKind::UnsavedResponse,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::NotFound { stage, .. }
            | Self::InvalidState { stage, .. }
            | Self::Storage { stage, .. }
            | Self::EncodeContent { stage, .. }
            | Self::DecodeContent { stage, .. }
            | Self::ConcurrentStream { stage, .. }
            | Self::Provider { stage, .. }
            | Self::ProviderStream { stage, .. }
            | Self::UnsavedResponse { stage, .. } => stage,
        }
    }

    /// The generated-but-unsaved response, when there is one.
    pub fn unsaved_message(&self) -> Option<&Message> {
        match self {
            Self::UnsavedResponse { message, .. } => Some(message),
            _ => None,
        }
    }
}
