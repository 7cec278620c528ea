use std::collections::HashMap;

use snafu::ensure;
use tokio::sync::RwLock;

use super::error::{ConflictSnafu, InvariantViolationSnafu, StorageResult};
use super::ids::{ConversationId, FolderId, MessageId};
use super::types::{ConversationRecord, FolderRecord, MessageRecord, WriteBatch, WriteOp};
use super::{BatchWriter, BoxFuture, ConversationStore, FolderStore, MessageStore};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, ConversationRecord>,
    messages: HashMap<MessageId, MessageRecord>,
    folders: HashMap<FolderId, FolderRecord>,
}

/// Process-local gateway with the same transactional contract as [`super::SqliteStorage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }

    pub async fn conversation_count(&self) -> usize {
        self.state.read().await.conversations.len()
    }
}

impl ConversationStore for MemoryStorage {
    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.conversations.get(&conversation_id).cloned())
        })
    }

    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut records = state.conversations.values().cloned().collect::<Vec<_>>();
            records.sort_by(|left, right| {
                right
                    .updated_at_unix_ms
                    .cmp(&left.updated_at_unix_ms)
                    .then_with(|| right.id.cmp(&left.id))
            });
            Ok(records)
        })
    }
}

impl MessageStore for MemoryStorage {
    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.messages.get(&message_id).cloned())
        })
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut records = state
                .messages
                .values()
                .filter(|record| record.conversation_id == conversation_id)
                .cloned()
                .collect::<Vec<_>>();
            records.sort_by(|left, right| {
                left.created_at_unix_ms
                    .cmp(&right.created_at_unix_ms)
                    .then_with(|| left.id.cmp(&right.id))
            });
            Ok(records)
        })
    }
}

impl FolderStore for MemoryStorage {
    fn get_folder(&self, folder_id: FolderId) -> BoxFuture<'_, StorageResult<Option<FolderRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.folders.get(&folder_id).cloned())
        })
    }

    fn list_folders(&self) -> BoxFuture<'_, StorageResult<Vec<FolderRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut records = state.folders.values().cloned().collect::<Vec<_>>();
            records.sort_by(|left, right| {
                left.position
                    .cmp(&right.position)
                    .then_with(|| left.id.cmp(&right.id))
            });
            Ok(records)
        })
    }
}

impl BatchWriter for MemoryStorage {
    fn ping(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn commit(&self, batch: WriteBatch) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            // Stage on a copy so a failing op leaves the visible state untouched.
            let mut staged = state.clone();
            for op in batch.into_ops() {
                apply_op(&mut staged, op)?;
            }
            *state = staged;
            Ok(())
        })
    }
}

fn apply_op(state: &mut MemoryState, op: WriteOp) -> StorageResult<()> {
    match op {
        WriteOp::CreateConversation(record) => {
            ensure!(
                !state.conversations.contains_key(&record.id),
                ConflictSnafu {
                    stage: "memory-create-conversation",
                    entity: "conversation",
                    details: format!("conversation '{}' already exists", record.id),
                }
            );
            state.conversations.insert(record.id, record);
        }
        WriteOp::PutConversation(record) => {
            state.conversations.insert(record.id, record);
        }
        WriteOp::DeleteConversation(conversation_id) => {
            state.conversations.remove(&conversation_id);
            state
                .messages
                .retain(|_, record| record.conversation_id != conversation_id);
        }
        WriteOp::CreateMessage(record) => {
            ensure!(
                !state.messages.contains_key(&record.id),
                ConflictSnafu {
                    stage: "memory-create-message",
                    entity: "message",
                    details: format!("message '{}' already exists", record.id),
                }
            );
            ensure_conversation_exists(state, &record, "memory-create-message-scope")?;
            state.messages.insert(record.id, record);
        }
        WriteOp::PutMessage(record) => {
            ensure_conversation_exists(state, &record, "memory-put-message-scope")?;
            if let Some(existing) = state.messages.get(&record.id) {
                ensure!(
                    existing.conversation_id == record.conversation_id,
                    InvariantViolationSnafu {
                        stage: "memory-put-message-cross-conversation",
                        details: format!(
                            "message '{}' belongs to conversation '{}'",
                            record.id, existing.conversation_id
                        ),
                    }
                );
            }
            state.messages.insert(record.id, record);
        }
        WriteOp::DeleteMessage {
            conversation_id,
            message_id,
        } => {
            if let Some(existing) = state.messages.get(&message_id) {
                ensure!(
                    existing.conversation_id == conversation_id,
                    InvariantViolationSnafu {
                        stage: "memory-delete-message-cross-conversation",
                        details: format!(
                            "message '{message_id}' does not belong to conversation '{conversation_id}'"
                        ),
                    }
                );
                state.messages.remove(&message_id);
            }
        }
        WriteOp::PutFolder(record) => {
            state.folders.insert(record.id, record);
        }
        WriteOp::DeleteFolder(folder_id) => {
            state.folders.remove(&folder_id);
        }
    }

    Ok(())
}

fn ensure_conversation_exists(
    state: &MemoryState,
    record: &MessageRecord,
    stage: &'static str,
) -> StorageResult<()> {
    ensure!(
        state.conversations.contains_key(&record.conversation_id),
        InvariantViolationSnafu {
            stage,
            details: format!(
                "message '{}' references missing conversation '{}'",
                record.id, record.conversation_id
            ),
        }
    );
    Ok(())
}
