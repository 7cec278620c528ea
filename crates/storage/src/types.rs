use super::ids::{ConversationId, FolderId, MessageId};

/// Title given to conversations before the first user turn renames them.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Storage-local message role, intentionally decoupled from engine-layer role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    pub folder_id: Option<FolderId>,
    pub root_message_id: Option<MessageId>,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    /// Serialized content parts; the store treats it as opaque text.
    pub content_json: String,
    pub parent_id: Option<MessageId>,
    pub child_ids: Vec<MessageId>,
    pub active_child_index: Option<u32>,
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRecord {
    pub id: FolderId,
    pub name: String,
    pub position: u32,
    pub created_at_unix_ms: u64,
}

/// One mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    CreateConversation(ConversationRecord),
    PutConversation(ConversationRecord),
    DeleteConversation(ConversationId),
    CreateMessage(MessageRecord),
    PutMessage(MessageRecord),
    DeleteMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    PutFolder(FolderRecord),
    DeleteFolder(FolderId),
}

impl WriteOp {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateConversation(_) => "create-conversation",
            Self::PutConversation(_) => "put-conversation",
            Self::DeleteConversation(_) => "delete-conversation",
            Self::CreateMessage(_) => "create-message",
            Self::PutMessage(_) => "put-message",
            Self::DeleteMessage { .. } => "delete-message",
            Self::PutFolder(_) => "put-folder",
            Self::DeleteFolder(_) => "delete-folder",
        }
    }
}

/// Ordered set of writes applied as one transaction: all of them land or none do.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn create_conversation(&mut self, record: ConversationRecord) -> &mut Self {
        self.push(WriteOp::CreateConversation(record))
    }

    pub fn put_conversation(&mut self, record: ConversationRecord) -> &mut Self {
        self.push(WriteOp::PutConversation(record))
    }

    pub fn delete_conversation(&mut self, id: ConversationId) -> &mut Self {
        self.push(WriteOp::DeleteConversation(id))
    }

    pub fn create_message(&mut self, record: MessageRecord) -> &mut Self {
        self.push(WriteOp::CreateMessage(record))
    }

    pub fn put_message(&mut self, record: MessageRecord) -> &mut Self {
        self.push(WriteOp::PutMessage(record))
    }

    pub fn delete_message(
        &mut self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> &mut Self {
        self.push(WriteOp::DeleteMessage {
            conversation_id,
            message_id,
        })
    }

    pub fn put_folder(&mut self, record: FolderRecord) -> &mut Self {
        self.push(WriteOp::PutFolder(record))
    }

    pub fn delete_folder(&mut self, id: FolderId) -> &mut Self {
        self.push(WriteOp::DeleteFolder(id))
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
