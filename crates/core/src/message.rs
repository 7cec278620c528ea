use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

pub use arbor_llm::StreamSessionId;
pub use arbor_storage::{ConversationId, FolderId, MessageId};
use arbor_storage::{ConversationRecord, FolderRecord, MessageRecord, MessageRole, now_unix_ms};

use crate::error::{DecodeContentSnafu, EncodeContentSnafu, EngineResult};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl From<MessageRole> for Role {
    fn from(value: MessageRole) -> Self {
        match value {
            MessageRole::System => Self::System,
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
        }
    }
}

impl From<Role> for MessageRole {
    fn from(value: Role) -> Self {
        match value {
            Role::System => Self::System,
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

impl From<Role> for arbor_llm::Role {
    fn from(value: Role) -> Self {
        match value {
            Role::System => Self::System,
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

/// One typed piece of a message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    File {
        name: String,
        uri: String,
        mime_type: String,
    },
    Image {
        uri: String,
        mime_type: String,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Self::Text { text } => text.trim().is_empty(),
            Self::File { uri, .. } | Self::Image { uri, .. } => uri.trim().is_empty(),
        }
    }

    /// Plain-text rendering used for provider prompts and titles.
    pub fn render(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::File { name, .. } => format!("[file: {name}]"),
            Self::Image { uri, .. } => format!("[image: {uri}]"),
        }
    }
}

/// Whether a message is part of the durable tree or a transient streaming placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Committed,
    Pending(StreamSessionId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: Vec<ContentPart>,
    pub parent_id: Option<MessageId>,
    /// Replies to this message; siblings are alternative branches.
    pub child_ids: Vec<MessageId>,
    /// Index into `child_ids` of the live branch. `None` marks a leaf of the active path.
    pub active_child: Option<usize>,
    pub status: MessageStatus,
    pub created_at_unix_ms: u64,
}

impl Message {
    pub fn new(
        conversation_id: ConversationId,
        role: Role,
        content: Vec<ContentPart>,
        parent_id: Option<MessageId>,
    ) -> Self {
        Self {
            id: MessageId::new_v7(),
            conversation_id,
            role,
            content,
            parent_id,
            child_ids: Vec::new(),
            active_child: None,
            status: MessageStatus::Committed,
            created_at_unix_ms: now_unix_ms(),
        }
    }

    /// Creates an empty assistant placeholder for an in-flight stream.
    pub fn pending_assistant(
        conversation_id: ConversationId,
        parent_id: MessageId,
        session_id: StreamSessionId,
    ) -> Self {
        Self {
            status: MessageStatus::Pending(session_id),
            ..Self::new(conversation_id, Role::Assistant, Vec::new(), Some(parent_id))
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, MessageStatus::Pending(_))
    }

    pub fn has_content(&self) -> bool {
        self.content.iter().any(|part| !part.is_blank())
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::File { .. } | ContentPart::Image { .. } => None,
            })
            .collect()
    }

    pub fn rendered_content(&self) -> String {
        self.content
            .iter()
            .map(ContentPart::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Active child id, or `None` when the index is unset or out of range.
    pub fn active_child_id(&self) -> Option<MessageId> {
        self.active_child
            .and_then(|index| self.child_ids.get(index))
            .copied()
    }

    /// Appends streamed text, extending the trailing text part when there is one.
    pub fn push_text(&mut self, delta: &str) {
        if let Some(ContentPart::Text { text }) = self.content.last_mut() {
            text.push_str(delta);
        } else {
            self.content.push(ContentPart::text(delta));
        }
    }

    pub(crate) fn to_record(&self) -> EngineResult<MessageRecord> {
        let content_json = serde_json::to_string(&self.content).context(EncodeContentSnafu {
            stage: "message-to-record",
        })?;

        Ok(MessageRecord {
            id: self.id,
            conversation_id: self.conversation_id,
            role: self.role.into(),
            content_json,
            parent_id: self.parent_id,
            child_ids: self.child_ids.clone(),
            active_child_index: self
                .active_child
                .and_then(|index| u32::try_from(index).ok()),
            created_at_unix_ms: self.created_at_unix_ms,
        })
    }

    pub(crate) fn from_record(record: MessageRecord) -> EngineResult<Self> {
        let content = serde_json::from_str(&record.content_json).context(DecodeContentSnafu {
            stage: "message-from-record",
            id: record.id.to_string(),
        })?;

        Ok(Self {
            id: record.id,
            conversation_id: record.conversation_id,
            role: record.role.into(),
            content,
            parent_id: record.parent_id,
            child_ids: record.child_ids,
            active_child: record.active_child_index.map(|index| index as usize),
            status: MessageStatus::Committed,
            created_at_unix_ms: record.created_at_unix_ms,
        })
    }
}

/// Conversation aggregate: metadata plus the message tree it exclusively owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub folder_id: Option<FolderId>,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
    pub root_message_id: Option<MessageId>,
    /// Keyed storage only; tree order comes from traversal.
    pub messages: HashMap<MessageId, Message>,
    pub(crate) current_leaf: Option<MessageId>,
}

impl Conversation {
    /// Builds a conversation and derives its active leaf.
    pub fn from_parts(
        id: ConversationId,
        title: impl Into<String>,
        folder_id: Option<FolderId>,
        root_message_id: Option<MessageId>,
        messages: HashMap<MessageId, Message>,
    ) -> Self {
        let now = now_unix_ms();
        let mut conversation = Self {
            id,
            title: title.into(),
            folder_id,
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
            root_message_id,
            messages,
            current_leaf: None,
        };
        crate::tree::refresh_leaf(&mut conversation);
        conversation
    }

    pub fn message(&self, message_id: MessageId) -> Option<&Message> {
        self.messages.get(&message_id)
    }

    pub fn root(&self) -> Option<&Message> {
        self.root_message_id
            .and_then(|root_id| self.messages.get(&root_id))
    }

    /// Last message of the active path, maintained incrementally by tree mutations.
    pub fn current_leaf(&self) -> Option<MessageId> {
        self.current_leaf
    }

    pub fn has_pending(&self) -> bool {
        self.messages.values().any(Message::is_pending)
    }

    pub fn pending_message(&self) -> Option<&Message> {
        self.messages.values().find(|message| message.is_pending())
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id,
            title: self.title.clone(),
            folder_id: self.folder_id,
            created_at_unix_ms: self.created_at_unix_ms,
            updated_at_unix_ms: self.updated_at_unix_ms,
        }
    }

    pub(crate) fn to_record(&self) -> ConversationRecord {
        ConversationRecord {
            id: self.id,
            title: self.title.clone(),
            folder_id: self.folder_id,
            root_message_id: self.root_message_id,
            created_at_unix_ms: self.created_at_unix_ms,
            updated_at_unix_ms: self.updated_at_unix_ms,
        }
    }

    pub(crate) fn from_records(
        record: ConversationRecord,
        message_records: Vec<MessageRecord>,
    ) -> EngineResult<Self> {
        let mut messages = HashMap::with_capacity(message_records.len());
        for message_record in message_records {
            let message = Message::from_record(message_record)?;
            messages.insert(message.id, message);
        }

        let mut conversation = Self {
            id: record.id,
            title: record.title,
            folder_id: record.folder_id,
            created_at_unix_ms: record.created_at_unix_ms,
            updated_at_unix_ms: record.updated_at_unix_ms,
            root_message_id: record.root_message_id,
            messages,
            current_leaf: None,
        };
        crate::tree::refresh_leaf(&mut conversation);
        Ok(conversation)
    }
}

/// Listing row for conversation pickers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    pub folder_id: Option<FolderId>,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

impl From<ConversationRecord> for ConversationSummary {
    fn from(record: ConversationRecord) -> Self {
        Self {
            id: record.id,
            title: record.title,
            folder_id: record.folder_id,
            created_at_unix_ms: record.created_at_unix_ms,
            updated_at_unix_ms: record.updated_at_unix_ms,
        }
    }
}

/// Named, ordered grouping; conversations reference it but it does not own them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub id: FolderId,
    pub name: String,
    pub position: u32,
    pub created_at_unix_ms: u64,
}

impl From<FolderRecord> for Folder {
    fn from(record: FolderRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            position: record.position,
            created_at_unix_ms: record.created_at_unix_ms,
        }
    }
}

impl From<&Folder> for FolderRecord {
    fn from(folder: &Folder) -> Self {
        Self {
            id: folder.id,
            name: folder.name.clone(),
            position: folder.position,
            created_at_unix_ms: folder.created_at_unix_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_preserve_tree_links_and_typed_content() {
        let conversation_id = ConversationId::new_v7();
        let mut message = Message::new(
            conversation_id,
            Role::User,
            vec![
                ContentPart::text("look at this"),
                ContentPart::Image {
                    uri: "file:///tmp/cat.png".to_string(),
                    mime_type: "image/png".to_string(),
                },
            ],
            Some(MessageId::new_v7()),
        );
        message.child_ids = vec![MessageId::new_v7(), MessageId::new_v7()];
        message.active_child = Some(1);

        let record = message.to_record().expect("encodes");
        assert_eq!(record.active_child_index, Some(1));
        assert_eq!(record.role, MessageRole::User);

        let restored = Message::from_record(record).expect("decodes");
        assert_eq!(restored, message);
    }

    #[test]
    fn unreadable_content_is_reported_with_the_message_id() {
        let conversation_id = ConversationId::new_v7();
        let mut record = Message::new(conversation_id, Role::User, Vec::new(), None)
            .to_record()
            .expect("encodes");
        record.content_json = "{not json".to_string();
        let id = record.id;

        let error = Message::from_record(record).expect_err("corrupt content");
        assert!(error.to_string().contains(&id.to_string()));
    }

    #[test]
    fn push_text_extends_trailing_text_part() {
        let mut message = Message::pending_assistant(
            ConversationId::new_v7(),
            MessageId::new_v7(),
            StreamSessionId::new(1),
        );
        assert!(!message.has_content());

        message.push_text("H");
        message.push_text("i");
        assert_eq!(message.content, vec![ContentPart::text("Hi")]);
        assert!(message.is_pending());
    }

    #[test]
    fn blank_parts_do_not_count_as_content() {
        let message = Message::new(
            ConversationId::new_v7(),
            Role::User,
            vec![ContentPart::text("   ")],
            None,
        );
        assert!(!message.has_content());
    }
}
