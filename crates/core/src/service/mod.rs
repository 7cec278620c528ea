//! Conversation Service: the single writer of conversation trees.
//!
//! Mutations clone the cached conversation, edit the clone, persist the touched records of
//! its placeholder-free view in one batch, and only then publish the clone.

mod folders;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use arbor_storage::{DEFAULT_CONVERSATION_TITLE, Storage, WriteBatch, now_unix_ms};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{
    EngineError, EngineResult, InvalidStateSnafu, NotFoundSnafu, StorageSnafu,
};
use crate::message::{
    ContentPart, Conversation, ConversationId, ConversationSummary, FolderId, Message, MessageId,
    Role, StreamSessionId,
};
use crate::observer::{Observers, Subscription};
use crate::tree::{self, BranchStep, TreeViolation};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const DEFAULT_TITLE_MAX_CHARS: usize = 30;

/// Receives conversation snapshots after each change.
pub trait ConversationListener: Send + Sync {
    fn on_conversation_changed(&self, conversation: &Conversation);
    fn on_conversation_deleted(&self, _conversation_id: ConversationId) {}
}

impl<F> ConversationListener for F
where
    F: Fn(&Conversation) + Send + Sync,
{
    fn on_conversation_changed(&self, conversation: &Conversation) {
        self(conversation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub system_prompt: String,
    pub title_max_chars: usize,
    pub init_retry_attempts: u32,
    pub init_retry_backoff: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            title_max_chars: DEFAULT_TITLE_MAX_CHARS,
            init_retry_attempts: 5,
            init_retry_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Ready,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Durability {
    Persist,
    MemoryOnly,
}

/// Message ids a mutation created, rewrote, or removed.
#[derive(Debug, Default)]
struct Touched {
    created: Vec<MessageId>,
    updated: Vec<MessageId>,
    deleted: Vec<MessageId>,
}

impl Touched {
    fn create(&mut self, message_id: MessageId) {
        self.created.push(message_id);
    }

    fn update(&mut self, message_id: MessageId) {
        if !self.updated.contains(&message_id) {
            self.updated.push(message_id);
        }
    }

    fn delete(&mut self, message_ids: impl IntoIterator<Item = MessageId>) {
        self.deleted.extend(message_ids);
    }
}

/// Owns the cached conversation trees and writes them through the storage gateway.
pub struct ConversationService {
    storage: Arc<dyn Storage>,
    config: ServiceConfig,
    lifecycle: RwLock<Lifecycle>,
    cache: RwLock<HashMap<ConversationId, Conversation>>,
    write_locks: Mutex<HashMap<ConversationId, Arc<AsyncMutex<()>>>>,
    folder_lock: AsyncMutex<()>,
    observers: Observers<dyn ConversationListener>,
}

impl ConversationService {
    /// Creates an uninitialized service; call [`Self::initialize`] before use.
    pub fn new(storage: Arc<dyn Storage>, config: ServiceConfig) -> Self {
        Self {
            storage,
            config,
            lifecycle: RwLock::new(Lifecycle::Created),
            cache: RwLock::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
            folder_lock: AsyncMutex::new(()),
            observers: Observers::new(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Waits for the gateway with bounded exponential backoff.
    pub async fn initialize(&self) -> EngineResult<()> {
        let stage = "initialize";
        match *read(&self.lifecycle) {
            Lifecycle::Ready => return Ok(()),
            Lifecycle::Disposed => {
                return InvalidStateSnafu {
                    stage,
                    details: "conversation service was disposed",
                }
                .fail();
            }
            Lifecycle::Created => {}
        }

        let attempts = self.config.init_retry_attempts.max(1);
        let mut backoff = self.config.init_retry_backoff;
        let mut attempt = 1;
        loop {
            match self.storage.ping().await {
                Ok(()) => break,
                Err(source) if attempt >= attempts => {
                    tracing::error!(attempt, error = %source, "storage never became ready");
                    return Err(source).context(StorageSnafu { stage });
                }
                Err(source) => {
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %source,
                        "storage not ready, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
            }
        }

        *write(&self.lifecycle) = Lifecycle::Ready;
        tracing::info!(attempt, "conversation service ready");
        Ok(())
    }

    /// Drops cached state and listeners; later calls fail with `InvalidState`.
    pub fn dispose(&self) {
        *write(&self.lifecycle) = Lifecycle::Disposed;
        write(&self.cache).clear();
        lock(&self.write_locks).clear();
        self.observers.clear();
        tracing::info!("conversation service disposed");
    }

    /// `true` between a successful `initialize` and `dispose`.
    pub fn is_ready(&self) -> bool {
        *read(&self.lifecycle) == Lifecycle::Ready
    }

    /// The listener stays registered until the returned [`Subscription`] is dropped.
    pub fn subscribe(&self, listener: Arc<dyn ConversationListener>) -> Subscription {
        self.observers.subscribe(listener)
    }

    /// Creates a conversation holding only the system root. A blank title falls back to the default.
    pub async fn create_conversation(
        &self,
        title: impl Into<String>,
        folder_id: Option<FolderId>,
    ) -> EngineResult<Conversation> {
        let stage = "create-conversation";
        self.ensure_ready(stage)?;
        if let Some(folder_id) = folder_id {
            self.require_folder(folder_id, stage).await?;
        }

        let title = title.into();
        let title = match title.trim() {
            "" => DEFAULT_CONVERSATION_TITLE,
            trimmed => trimmed,
        };
        let conversation_id = ConversationId::new_v7();
        let mut conversation =
            Conversation::from_parts(conversation_id, title, folder_id, None, HashMap::new());

        let system_content = if self.config.system_prompt.trim().is_empty() {
            Vec::new()
        } else {
            vec![ContentPart::text(self.config.system_prompt.clone())]
        };
        let system = Message::new(conversation_id, Role::System, system_content, None);
        tree::insert_root(&mut conversation, system).map_err(|violation| invalid(stage, violation))?;

        let mut batch = WriteBatch::new();
        batch.create_conversation(conversation.to_record());
        for message in conversation.messages.values() {
            batch.create_message(message.to_record()?);
        }
        self.storage
            .commit(batch)
            .await
            .context(StorageSnafu { stage })?;

        write(&self.cache).insert(conversation_id, conversation.clone());
        tracing::debug!(conversation_id = %conversation_id, title = %conversation.title, "conversation created");
        self.observers
            .notify(|listener| listener.on_conversation_changed(&conversation));
        Ok(conversation)
    }

    /// Serves from the cache; a cold load holds the conversation's write lock so a concurrent
    /// delete cannot be undone by a stale read.
    pub async fn get_conversation(&self, conversation_id: ConversationId) -> EngineResult<Conversation> {
        let stage = "get-conversation";
        self.ensure_ready(stage)?;
        if let Some(cached) = read(&self.cache).get(&conversation_id) {
            return Ok(cached.clone());
        }

        let write_lock = self.write_lock(conversation_id);
        let _guard = write_lock.lock().await;
        self.load(conversation_id, stage).await
    }

    /// Most recently updated first.
    pub async fn list_conversations(&self) -> EngineResult<Vec<ConversationSummary>> {
        let stage = "list-conversations";
        self.ensure_ready(stage)?;
        let records = self
            .storage
            .list_conversations()
            .await
            .context(StorageSnafu { stage })?;
        Ok(records.into_iter().map(ConversationSummary::from).collect())
    }

    /// Root-to-leaf messages along the active children, system root included.
    pub async fn active_path(&self, conversation_id: ConversationId) -> EngineResult<Vec<Message>> {
        let conversation = self.get_conversation(conversation_id).await?;
        Ok(tree::resolve_active_path(&conversation)
            .into_iter()
            .cloned()
            .collect())
    }

    /// The active path without system messages.
    pub async fn visible_path(&self, conversation_id: ConversationId) -> EngineResult<Vec<Message>> {
        let conversation = self.get_conversation(conversation_id).await?;
        Ok(tree::visible_path(&conversation).into_iter().cloned().collect())
    }

    /// Adds a user message under the current leaf. When the conversation held only its system
    /// root, the title is derived from the new message.
    pub async fn append_user_turn(
        &self,
        conversation_id: ConversationId,
        content: Vec<ContentPart>,
    ) -> EngineResult<(Conversation, Message)> {
        let stage = "append-user-turn";
        ensure_content(&content, stage)?;
        let title_max_chars = self.config.title_max_chars;

        self.mutate(conversation_id, stage, Durability::Persist, |draft, touched| {
            ensure_not_streaming(draft, stage)?;
            let first_turn = draft.messages.len() == 1
                && draft.root().is_some_and(|root| root.role == Role::System);

            let message = Message::new(draft.id, Role::User, content, draft.current_leaf());
            let message_id = message.id;
            match draft.current_leaf() {
                Some(leaf_id) => {
                    tree::insert_child(draft, leaf_id, message)
                        .map_err(|violation| invalid(stage, violation))?;
                    touched.update(leaf_id);
                }
                None => {
                    tree::insert_root(draft, message).map_err(|violation| invalid(stage, violation))?;
                }
            }
            touched.create(message_id);

            let stored = stored_message(draft, message_id, stage)?;
            if first_turn
                && let Some(title) = derive_title(&stored, title_max_chars)
            {
                draft.title = title;
            }
            Ok(stored)
        })
        .await
    }

    /// Splices a new user message under `father_id` as a sibling of the edited turn.
    pub async fn insert_edited_user_turn(
        &self,
        conversation_id: ConversationId,
        father_id: MessageId,
        content: Vec<ContentPart>,
    ) -> EngineResult<(Conversation, Message)> {
        let stage = "insert-edited-user-turn";
        ensure_content(&content, stage)?;

        self.mutate(conversation_id, stage, Durability::Persist, |draft, touched| {
            splice_user_turn(draft, touched, father_id, content, stage)
        })
        .await
    }

    /// Edits a user turn by branching: the original stays as a sibling.
    pub async fn edit_user_turn(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        content: Vec<ContentPart>,
    ) -> EngineResult<(Conversation, Message)> {
        let stage = "edit-user-turn";
        ensure_content(&content, stage)?;

        self.mutate(conversation_id, stage, Durability::Persist, |draft, touched| {
            let original = draft.message(message_id).context(NotFoundSnafu {
                stage,
                entity: "message",
                id: message_id.to_string(),
            })?;
            ensure!(
                original.role == Role::User,
                InvalidStateSnafu {
                    stage,
                    details: format!("message '{message_id}' is not a user message"),
                }
            );
            let father_id = original.parent_id.context(InvalidStateSnafu {
                stage,
                details: format!("message '{message_id}' has no parent to branch from"),
            })?;
            splice_user_turn(draft, touched, father_id, content, stage)
        })
        .await
    }

    /// Drops any placeholder and splices `message` under `father_id`.
    pub async fn commit_assistant_turn(
        &self,
        conversation_id: ConversationId,
        father_id: MessageId,
        message: Message,
    ) -> EngineResult<Conversation> {
        let stage = "commit-assistant-turn";
        ensure_content(&message.content, stage)?;

        let (conversation, ()) = self
            .mutate(conversation_id, stage, Durability::Persist, |draft, touched| {
                tree::prune_pending(draft);
                let father = draft.message(father_id).context(InvalidStateSnafu {
                    stage,
                    details: format!("parent message '{father_id}' is not in the conversation"),
                })?;
                ensure!(
                    !father.is_pending(),
                    InvalidStateSnafu {
                        stage,
                        details: format!("parent message '{father_id}' is still streaming"),
                    }
                );

                let mut message = message;
                message.conversation_id = draft.id;
                message.status = crate::message::MessageStatus::Committed;
                message.child_ids.clear();
                message.active_child = None;
                let message_id = message.id;

                tree::insert_child(draft, father_id, message)
                    .map_err(|violation| invalid(stage, violation))?;
                touched.update(father_id);
                touched.create(message_id);
                Ok(())
            })
            .await?;
        Ok(conversation)
    }

    /// Removes a non-root message and its descendants.
    pub async fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> EngineResult<Conversation> {
        let stage = "delete-message";
        let (conversation, ()) = self
            .mutate(conversation_id, stage, Durability::Persist, |draft, touched| {
                let message = draft.message(message_id).context(NotFoundSnafu {
                    stage,
                    entity: "message",
                    id: message_id.to_string(),
                })?;
                let parent_id = message.parent_id.context(InvalidStateSnafu {
                    stage,
                    details: "the root message cannot be deleted",
                })?;
                let pending_id = draft.pending_message().map(|pending| pending.id);

                let removed = tree::delete_subtree(draft, message_id);
                ensure!(
                    pending_id.is_none_or(|pending_id| !removed.contains(&pending_id)),
                    InvalidStateSnafu {
                        stage,
                        details: "the branch is still streaming",
                    }
                );
                touched.update(parent_id);
                touched.delete(removed);
                Ok(())
            })
            .await?;
        Ok(conversation)
    }

    /// Keeps only the active path.
    pub async fn collapse_to_active_path(
        &self,
        conversation_id: ConversationId,
    ) -> EngineResult<Conversation> {
        let stage = "collapse-to-active-path";
        let (conversation, ()) = self
            .mutate(conversation_id, stage, Durability::Persist, |draft, touched| {
                ensure_not_streaming(draft, stage)?;
                let removed = tree::collapse_to_active_path(draft);
                if removed.is_empty() {
                    return Ok(());
                }
                for message in tree::resolve_active_path(draft) {
                    touched.update(message.id);
                }
                touched.delete(removed);
                Ok(())
            })
            .await?;
        Ok(conversation)
    }

    /// Activates the previous or next sibling of `message_id`.
    pub async fn switch_branch(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        step: BranchStep,
    ) -> EngineResult<Conversation> {
        let stage = "switch-branch";
        let (conversation, ()) = self
            .mutate(conversation_id, stage, Durability::Persist, |draft, touched| {
                ensure_not_streaming(draft, stage)?;
                let message = draft.message(message_id).context(NotFoundSnafu {
                    stage,
                    entity: "message",
                    id: message_id.to_string(),
                })?;
                let parent_id = message.parent_id.context(InvalidStateSnafu {
                    stage,
                    details: "the root message has no siblings",
                })?;
                tree::step_branch(draft, message_id, step).context(InvalidStateSnafu {
                    stage,
                    details: format!("no {step:?} sibling for message '{message_id}'"),
                })?;
                touched.update(parent_id);
                Ok(())
            })
            .await?;
        Ok(conversation)
    }

    /// Makes the `index`-th reply of `parent_id` the active one.
    pub async fn select_branch(
        &self,
        conversation_id: ConversationId,
        parent_id: MessageId,
        index: usize,
    ) -> EngineResult<Conversation> {
        let stage = "select-branch";
        let (conversation, ()) = self
            .mutate(conversation_id, stage, Durability::Persist, |draft, touched| {
                ensure_not_streaming(draft, stage)?;
                let parent = draft.message(parent_id).context(NotFoundSnafu {
                    stage,
                    entity: "message",
                    id: parent_id.to_string(),
                })?;
                let count = parent.child_ids.len();
                ensure!(
                    tree::select_branch(draft, parent_id, index),
                    InvalidStateSnafu {
                        stage,
                        details: format!("branch {index} is out of range for {count} replies"),
                    }
                );
                touched.update(parent_id);
                Ok(())
            })
            .await?;
        Ok(conversation)
    }

    /// Rejects blank titles.
    pub async fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        title: &str,
    ) -> EngineResult<Conversation> {
        let stage = "rename-conversation";
        let title = title.trim();
        ensure!(
            !title.is_empty(),
            InvalidStateSnafu {
                stage,
                details: "conversation title is empty",
            }
        );

        let (conversation, ()) = self
            .mutate(conversation_id, stage, Durability::Persist, |draft, _| {
                draft.title = title.to_string();
                Ok(())
            })
            .await?;
        Ok(conversation)
    }

    /// `None` moves the conversation out of any folder.
    pub async fn move_conversation_to_folder(
        &self,
        conversation_id: ConversationId,
        folder_id: Option<FolderId>,
    ) -> EngineResult<Conversation> {
        let stage = "move-conversation-to-folder";
        self.ensure_ready(stage)?;
        if let Some(folder_id) = folder_id {
            self.require_folder(folder_id, stage).await?;
        }

        let (conversation, ()) = self
            .mutate(conversation_id, stage, Durability::Persist, |draft, _| {
                draft.folder_id = folder_id;
                Ok(())
            })
            .await?;
        Ok(conversation)
    }

    /// Deletes the conversation and all of its messages in one transaction.
    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> EngineResult<()> {
        let stage = "delete-conversation";
        self.ensure_ready(stage)?;
        let write_lock = self.write_lock(conversation_id);
        let _guard = write_lock.lock().await;

        let conversation = self.load(conversation_id, stage).await?;
        let mut batch = WriteBatch::new();
        for message in conversation.messages.values().filter(|message| !message.is_pending()) {
            batch.delete_message(conversation_id, message.id);
        }
        batch.delete_conversation(conversation_id);
        self.storage
            .commit(batch)
            .await
            .context(StorageSnafu { stage })?;

        write(&self.cache).remove(&conversation_id);
        lock(&self.write_locks).remove(&conversation_id);
        tracing::debug!(
            conversation_id = %conversation_id,
            message_count = conversation.messages.len(),
            "conversation deleted"
        );
        self.observers
            .notify(|listener| listener.on_conversation_deleted(conversation_id));
        Ok(())
    }

    /// Adds an in-memory placeholder under `father_id` for a streaming session.
    pub(crate) async fn attach_pending(
        &self,
        conversation_id: ConversationId,
        father_id: MessageId,
        session_id: StreamSessionId,
    ) -> EngineResult<(Conversation, Message)> {
        let stage = "attach-pending";
        self.mutate(conversation_id, stage, Durability::MemoryOnly, |draft, _| {
            ensure_not_streaming(draft, stage)?;
            draft.message(father_id).context(NotFoundSnafu {
                stage,
                entity: "message",
                id: father_id.to_string(),
            })?;

            let placeholder = Message::pending_assistant(draft.id, father_id, session_id);
            let placeholder_id = placeholder.id;
            tree::insert_child(draft, father_id, placeholder)
                .map_err(|violation| invalid(stage, violation))?;
            stored_message(draft, placeholder_id, stage)
        })
        .await
    }

    pub(crate) async fn apply_pending_delta(
        &self,
        conversation_id: ConversationId,
        placeholder_id: MessageId,
        delta: &str,
    ) -> EngineResult<Conversation> {
        let stage = "apply-pending-delta";
        let (conversation, ()) = self
            .mutate(conversation_id, stage, Durability::MemoryOnly, |draft, _| {
                let placeholder = draft
                    .messages
                    .get_mut(&placeholder_id)
                    .context(NotFoundSnafu {
                        stage,
                        entity: "placeholder",
                        id: placeholder_id.to_string(),
                    })?;
                ensure!(
                    placeholder.is_pending(),
                    InvalidStateSnafu {
                        stage,
                        details: format!("message '{placeholder_id}' is not a placeholder"),
                    }
                );
                placeholder.push_text(delta);
                Ok(())
            })
            .await?;
        Ok(conversation)
    }

    /// Removes any placeholder, restoring the pre-stream active path.
    pub(crate) async fn discard_pending(
        &self,
        conversation_id: ConversationId,
    ) -> EngineResult<Conversation> {
        let stage = "discard-pending";
        let (conversation, ()) = self
            .mutate(conversation_id, stage, Durability::MemoryOnly, |draft, _| {
                tree::prune_pending(draft);
                Ok(())
            })
            .await?;
        Ok(conversation)
    }

    async fn mutate<T>(
        &self,
        conversation_id: ConversationId,
        stage: &'static str,
        durability: Durability,
        apply: impl FnOnce(&mut Conversation, &mut Touched) -> EngineResult<T>,
    ) -> EngineResult<(Conversation, T)> {
        self.ensure_ready(stage)?;
        let write_lock = self.write_lock(conversation_id);
        let _guard = write_lock.lock().await;

        let mut draft = self.load(conversation_id, stage).await?;
        let mut touched = Touched::default();
        let value = apply(&mut draft, &mut touched)?;

        if durability == Durability::Persist {
            draft.updated_at_unix_ms = now_unix_ms();
            let batch = persist_batch(&draft, &touched)?;
            let op_count = batch.len();
            if let Err(source) = self.storage.commit(batch).await {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    stage,
                    error = %source,
                    "conversation write failed, keeping previous state"
                );
                return Err(source).context(StorageSnafu { stage });
            }
            tracing::debug!(conversation_id = %conversation_id, stage, op_count, "conversation persisted");
        }

        write(&self.cache).insert(conversation_id, draft.clone());
        self.observers
            .notify(|listener| listener.on_conversation_changed(&draft));
        Ok((draft, value))
    }

    /// Callers hold the conversation's write lock.
    async fn load(
        &self,
        conversation_id: ConversationId,
        stage: &'static str,
    ) -> EngineResult<Conversation> {
        if let Some(cached) = read(&self.cache).get(&conversation_id) {
            return Ok(cached.clone());
        }

        let record = self
            .storage
            .get_conversation(conversation_id)
            .await
            .context(StorageSnafu { stage })?
            .context(NotFoundSnafu {
                stage,
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;
        let messages = self
            .storage
            .list_messages(conversation_id)
            .await
            .context(StorageSnafu { stage })?;
        let loaded = Conversation::from_records(record, messages)?;
        tracing::debug!(
            conversation_id = %conversation_id,
            message_count = loaded.messages.len(),
            "conversation loaded from storage"
        );

        write(&self.cache).insert(conversation_id, loaded.clone());
        Ok(loaded)
    }

    fn write_lock(&self, conversation_id: ConversationId) -> Arc<AsyncMutex<()>> {
        Arc::clone(lock(&self.write_locks).entry(conversation_id).or_default())
    }

    fn ensure_ready(&self, stage: &'static str) -> EngineResult<()> {
        match *read(&self.lifecycle) {
            Lifecycle::Ready => Ok(()),
            Lifecycle::Created => InvalidStateSnafu {
                stage,
                details: "conversation service is not initialized",
            }
            .fail(),
            Lifecycle::Disposed => InvalidStateSnafu {
                stage,
                details: "conversation service was disposed",
            }
            .fail(),
        }
    }
}

/// Records of the placeholder-free view that `touched` names.
fn persist_batch(draft: &Conversation, touched: &Touched) -> EngineResult<WriteBatch> {
    let view = if draft.has_pending() {
        Cow::Owned(tree::pruned(draft))
    } else {
        Cow::Borrowed(draft)
    };

    let mut batch = WriteBatch::new();
    batch.put_conversation(view.to_record());
    for message_id in &touched.created {
        if let Some(message) = view.message(*message_id) {
            batch.create_message(message.to_record()?);
        }
    }
    for message_id in &touched.updated {
        if touched.created.contains(message_id) {
            continue;
        }
        if let Some(message) = view.message(*message_id) {
            batch.put_message(message.to_record()?);
        }
    }
    for message_id in &touched.deleted {
        batch.delete_message(draft.id, *message_id);
    }
    Ok(batch)
}

fn splice_user_turn(
    draft: &mut Conversation,
    touched: &mut Touched,
    father_id: MessageId,
    content: Vec<ContentPart>,
    stage: &'static str,
) -> EngineResult<Message> {
    ensure_not_streaming(draft, stage)?;
    let message = Message::new(draft.id, Role::User, content, Some(father_id));
    let message_id = message.id;
    tree::insert_child(draft, father_id, message).map_err(|violation| invalid(stage, violation))?;
    touched.update(father_id);
    touched.create(message_id);
    stored_message(draft, message_id, stage)
}

fn stored_message(
    draft: &Conversation,
    message_id: MessageId,
    stage: &'static str,
) -> EngineResult<Message> {
    draft.message(message_id).cloned().context(NotFoundSnafu {
        stage,
        entity: "message",
        id: message_id.to_string(),
    })
}

fn ensure_content(content: &[ContentPart], stage: &'static str) -> EngineResult<()> {
    ensure!(
        content.iter().any(|part| !part.is_blank()),
        InvalidStateSnafu {
            stage,
            details: "message content is empty",
        }
    );
    Ok(())
}

fn ensure_not_streaming(conversation: &Conversation, stage: &'static str) -> EngineResult<()> {
    ensure!(
        !conversation.has_pending(),
        InvalidStateSnafu {
            stage,
            details: "a response is still streaming in this conversation",
        }
    );
    Ok(())
}

fn invalid(stage: &'static str, violation: TreeViolation) -> EngineError {
    EngineError::InvalidState {
        stage,
        details: violation.to_string(),
    }
}

/// Single-line title from the message text, truncated to `max_chars` scalar values.
pub(crate) fn derive_title(message: &Message, max_chars: usize) -> Option<String> {
    let text = message.text();
    let flattened = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flattened.is_empty() {
        return None;
    }
    if flattened.chars().count() <= max_chars {
        return Some(flattened);
    }
    let head = flattened.chars().take(max_chars).collect::<String>();
    Some(format!("{}...", head.trim_end()))
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
