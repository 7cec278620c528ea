use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, FolderId, MessageId};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    ConversationRecord, DEFAULT_CONVERSATION_TITLE, FolderRecord, MessageRecord, MessageRole,
    WriteBatch, WriteOp,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Read access to conversation records.
pub trait ConversationStore: Send + Sync {
    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>>;
    /// Most recently updated first.
    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>>;
}

/// Read access to message records.
pub trait MessageStore: Send + Sync {
    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>>;
    /// Index lookup by owning conversation, ordered by creation time.
    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
}

/// Read access to folder records.
pub trait FolderStore: Send + Sync {
    fn get_folder(&self, folder_id: FolderId) -> BoxFuture<'_, StorageResult<Option<FolderRecord>>>;
    /// Ordered by position.
    fn list_folders(&self) -> BoxFuture<'_, StorageResult<Vec<FolderRecord>>>;
}

/// Applies a [`WriteBatch`] atomically: every op lands or none does.
pub trait BatchWriter: Send + Sync {
    /// Resolves once the store can serve reads and writes.
    fn ping(&self) -> BoxFuture<'_, StorageResult<()>>;
    fn commit(&self, batch: WriteBatch) -> BoxFuture<'_, StorageResult<()>>;
}

/// The full gateway the conversation service writes through.
pub trait Storage: ConversationStore + MessageStore + FolderStore + BatchWriter {}

impl<T> Storage for T where T: ConversationStore + MessageStore + FolderStore + BatchWriter {}

pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
