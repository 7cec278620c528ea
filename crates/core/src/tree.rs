//! Pure operations over a conversation's message tree.
//!
//! Every function tolerates malformed input: dangling ids, out-of-range active indices and
//! cycles end a traversal instead of panicking.

use std::collections::{HashSet, VecDeque};

use snafu::{Snafu, ensure};

use crate::message::{Conversation, Message, MessageId};

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum TreeViolation {
    #[snafu(display("parent message '{father_id}' is not in the conversation"))]
    MissingFather { father_id: MessageId },
    #[snafu(display("message '{message_id}' is already in the conversation"))]
    DuplicateMessage { message_id: MessageId },
    #[snafu(display("conversation already has root message '{root_id}'"))]
    RootExists { root_id: MessageId },
}

/// Sibling navigation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchStep {
    Previous,
    Next,
}

/// Where a message sits among its siblings, zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchPosition {
    pub index: usize,
    pub count: usize,
}

/// Root first, following each message's active child until a leaf.
pub fn resolve_active_path(conversation: &Conversation) -> Vec<&Message> {
    let mut path = Vec::new();
    let mut visited = HashSet::new();
    let mut next = conversation.root_message_id;

    while let Some(message_id) = next {
        if !visited.insert(message_id) {
            tracing::warn!(
                conversation_id = %conversation.id,
                message_id = %message_id,
                "active path revisits a message, stopping traversal"
            );
            break;
        }
        let Some(message) = conversation.messages.get(&message_id) else {
            break;
        };
        path.push(message);
        next = message.active_child_id();
    }

    path
}

/// Active path without system turns.
pub fn visible_path(conversation: &Conversation) -> Vec<&Message> {
    resolve_active_path(conversation)
        .into_iter()
        .filter(|message| message.role != crate::message::Role::System)
        .collect()
}

pub fn active_leaf(conversation: &Conversation) -> Option<MessageId> {
    resolve_active_path(conversation)
        .last()
        .map(|message| message.id)
}

/// Ancestors of `message_id` via parent links, root first, ending at the message itself.
pub fn lineage(conversation: &Conversation, message_id: MessageId) -> Vec<&Message> {
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut next = Some(message_id);

    while let Some(current_id) = next {
        if !visited.insert(current_id) {
            break;
        }
        let Some(message) = conversation.messages.get(&current_id) else {
            break;
        };
        chain.push(message);
        next = message.parent_id;
    }

    chain.reverse();
    chain
}

/// Adds `child_id` as the live continuation of `parent`.
pub fn append_child(parent: &mut Message, child_id: MessageId) -> usize {
    splice_branch(parent, child_id)
}

/// Inserts `child_id` right after the current active child, or at the end when there is
/// none, and makes it active. Returns its index.
pub fn splice_branch(father: &mut Message, child_id: MessageId) -> usize {
    let index = match father.active_child {
        Some(active) if active < father.child_ids.len() => active + 1,
        _ => father.child_ids.len(),
    };
    father.child_ids.insert(index, child_id);
    father.active_child = Some(index);
    index
}

/// Installs `message` as the first message of an empty conversation.
pub fn insert_root(conversation: &mut Conversation, mut message: Message) -> Result<(), TreeViolation> {
    if let Some(root_id) = conversation.root_message_id {
        return RootExistsSnafu { root_id }.fail();
    }
    ensure!(
        !conversation.messages.contains_key(&message.id),
        DuplicateMessageSnafu {
            message_id: message.id
        }
    );

    message.parent_id = None;
    let message_id = message.id;
    conversation.messages.insert(message_id, message);
    conversation.root_message_id = Some(message_id);
    conversation.current_leaf = Some(message_id);
    Ok(())
}

/// Links `child` under `father_id` with the splice policy and stores it.
pub fn insert_child(
    conversation: &mut Conversation,
    father_id: MessageId,
    mut child: Message,
) -> Result<usize, TreeViolation> {
    ensure!(
        !conversation.messages.contains_key(&child.id),
        DuplicateMessageSnafu {
            message_id: child.id
        }
    );
    let Some(father) = conversation.messages.get_mut(&father_id) else {
        return MissingFatherSnafu { father_id }.fail();
    };

    let child_id = child.id;
    let index = splice_branch(father, child_id);
    child.parent_id = Some(father_id);
    conversation.messages.insert(child_id, child);

    if conversation.current_leaf == Some(father_id) {
        conversation.current_leaf = Some(child_id);
    } else {
        refresh_leaf(conversation);
    }
    Ok(index)
}

/// Removes every placeholder (and anything hanging off one). Returns the removed ids.
pub fn prune_pending(conversation: &mut Conversation) -> Vec<MessageId> {
    let pending = conversation
        .messages
        .values()
        .filter(|message| message.is_pending())
        .map(|message| message.id)
        .collect::<Vec<_>>();
    if pending.is_empty() {
        return Vec::new();
    }

    let removed = collect_subtrees(conversation, &pending);
    remove_messages(conversation, &removed);
    removed
}

/// Placeholder-free copy; the input is left untouched.
pub fn pruned(conversation: &Conversation) -> Conversation {
    let mut copy = conversation.clone();
    prune_pending(&mut copy);
    copy
}

/// Removes `message_id` and all of its descendants. Returns the removed ids.
pub fn delete_subtree(conversation: &mut Conversation, message_id: MessageId) -> Vec<MessageId> {
    if !conversation.messages.contains_key(&message_id) {
        return Vec::new();
    }
    let removed = collect_subtrees(conversation, &[message_id]);
    remove_messages(conversation, &removed);
    removed
}

/// Drops every message that is not on the active path. Returns the removed ids.
pub fn collapse_to_active_path(conversation: &mut Conversation) -> Vec<MessageId> {
    let path = resolve_active_path(conversation)
        .into_iter()
        .map(|message| message.id)
        .collect::<Vec<_>>();
    if path.is_empty() {
        return Vec::new();
    }

    let keep = path.iter().copied().collect::<HashSet<_>>();
    let removed = conversation
        .messages
        .keys()
        .filter(|message_id| !keep.contains(message_id))
        .copied()
        .collect::<Vec<_>>();
    for message_id in &removed {
        conversation.messages.remove(message_id);
    }

    for (position, message_id) in path.iter().enumerate() {
        if let Some(message) = conversation.messages.get_mut(message_id) {
            match path.get(position + 1) {
                Some(next_id) => {
                    message.child_ids = vec![*next_id];
                    message.active_child = Some(0);
                }
                None => {
                    message.child_ids.clear();
                    message.active_child = None;
                }
            }
        }
    }

    conversation.current_leaf = path.last().copied();
    removed
}

/// Makes `parent_id`'s child at `index` active. `false` when either is out of range.
pub fn select_branch(conversation: &mut Conversation, parent_id: MessageId, index: usize) -> bool {
    let Some(parent) = conversation.messages.get_mut(&parent_id) else {
        return false;
    };
    if index >= parent.child_ids.len() {
        return false;
    }
    parent.active_child = Some(index);
    refresh_leaf(conversation);
    true
}

/// Activates the previous or next sibling of `message_id`. Returns the newly active sibling.
pub fn step_branch(
    conversation: &mut Conversation,
    message_id: MessageId,
    step: BranchStep,
) -> Option<MessageId> {
    let parent_id = conversation.messages.get(&message_id)?.parent_id?;
    let BranchPosition { index, count } = branch_position(conversation, message_id)?;

    let target = match step {
        BranchStep::Previous => index.checked_sub(1)?,
        BranchStep::Next if index + 1 < count => index + 1,
        BranchStep::Next => return None,
    };

    if !select_branch(conversation, parent_id, target) {
        return None;
    }
    conversation
        .messages
        .get(&parent_id)
        .and_then(|parent| parent.child_ids.get(target))
        .copied()
}

pub fn branch_position(conversation: &Conversation, message_id: MessageId) -> Option<BranchPosition> {
    let parent_id = conversation.messages.get(&message_id)?.parent_id?;
    let parent = conversation.messages.get(&parent_id)?;
    let index = parent.child_ids.iter().position(|id| *id == message_id)?;
    Some(BranchPosition {
        index,
        count: parent.child_ids.len(),
    })
}

pub(crate) fn refresh_leaf(conversation: &mut Conversation) {
    conversation.current_leaf = active_leaf(conversation);
}

fn collect_subtrees(conversation: &Conversation, starts: &[MessageId]) -> Vec<MessageId> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut queue = starts.iter().copied().collect::<VecDeque<_>>();

    while let Some(message_id) = queue.pop_front() {
        if !seen.insert(message_id) {
            continue;
        }
        let Some(message) = conversation.messages.get(&message_id) else {
            continue;
        };
        order.push(message_id);
        queue.extend(message.child_ids.iter().copied());
    }

    order
}

fn remove_messages(conversation: &mut Conversation, removed: &[MessageId]) {
    let removed_set = removed.iter().copied().collect::<HashSet<_>>();
    let mut parents = HashSet::new();

    for message_id in removed {
        if let Some(message) = conversation.messages.remove(message_id)
            && let Some(parent_id) = message.parent_id
            && !removed_set.contains(&parent_id)
        {
            parents.insert(parent_id);
        }
    }

    for parent_id in parents {
        if let Some(parent) = conversation.messages.get_mut(&parent_id) {
            retain_children(parent, |child_id| !removed_set.contains(&child_id));
        }
    }

    if conversation
        .root_message_id
        .is_some_and(|root_id| removed_set.contains(&root_id))
    {
        conversation.root_message_id = None;
    }
    refresh_leaf(conversation);
}

/// Filters `child_ids` and re-points the active index.
///
/// A surviving active child keeps being active at its new index. A removed one is replaced
/// by the nearest surviving sibling before it, else the first survivor.
fn retain_children(parent: &mut Message, mut keep: impl FnMut(MessageId) -> bool) {
    let original_len = parent.child_ids.len();
    let active = parent.active_child;
    let mut retained = Vec::with_capacity(original_len);
    let mut kept_active = None;
    let mut preceding = None;

    for (index, child_id) in parent.child_ids.iter().copied().enumerate() {
        if !keep(child_id) {
            continue;
        }
        if Some(index) == active {
            kept_active = Some(retained.len());
        } else if active.is_some_and(|active| index < active) {
            preceding = Some(retained.len());
        }
        retained.push(child_id);
    }

    let last = retained.len().checked_sub(1);
    parent.active_child = match active {
        None => None,
        Some(active) if active >= original_len => last,
        Some(_) => kept_active
            .or(preceding)
            .or(if retained.is_empty() { None } else { Some(0) }),
    };
    parent.child_ids = retained;
}
