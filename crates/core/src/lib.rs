pub mod error;
pub mod message;
pub mod observer;
pub mod service;
pub mod stream_state;
pub mod streaming;
pub mod tree;

#[cfg(test)]
mod test_support;

pub use error::{EngineError, EngineResult, ErrorKind};
pub use message::{
    ContentPart, Conversation, ConversationId, ConversationSummary, Folder, FolderId, Message,
    MessageId, MessageStatus, Role, StreamSessionId,
};
pub use observer::{Observers, Subscription};
pub use service::{
    ConversationListener, ConversationService, DEFAULT_SYSTEM_PROMPT, DEFAULT_TITLE_MAX_CHARS,
    ServiceConfig,
};
pub use stream_state::{StreamPhase, StreamState, StreamTarget};
pub use streaming::{
    CompletionOptions, StreamHandle, StreamListener, StreamOutcome, StreamingController,
};
pub use tree::{BranchPosition, BranchStep};
