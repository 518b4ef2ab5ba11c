//! Difference between the stored and the freshly extracted message lists

use std::collections::HashMap;

use crate::storage::ids::MessageId;
use crate::storage::types::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageUpdate {
    pub message_id: MessageId,
    pub old_content: String,
    pub new_content: String,
}

/// What changed between two snapshots. Only decides whether to write and
/// reports what happened; the write itself stores the whole new snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub new_messages: Vec<Message>,
    pub updated_messages: Vec<MessageUpdate>,
    pub removed_messages: Vec<Message>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.new_messages.is_empty()
            && self.updated_messages.is_empty()
            && self.removed_messages.is_empty()
    }

    /// Short description for logs
    pub fn summary(&self) -> String {
        format!(
            "+{} ~{} -{}",
            self.new_messages.len(),
            self.updated_messages.len(),
            self.removed_messages.len()
        )
    }
}

/// Compare by message id. New and updated entries follow `current` order,
/// removed entries follow `stored` order.
pub fn diff(stored: &[Message], current: &[Message]) -> ChangeSet {
    let stored_by_id: HashMap<&MessageId, &Message> =
        stored.iter().map(|m| (&m.message_id, m)).collect();
    let current_by_id: HashMap<&MessageId, &Message> =
        current.iter().map(|m| (&m.message_id, m)).collect();

    let mut changes = ChangeSet::default();

    for message in current {
        match stored_by_id.get(&message.message_id) {
            None => changes.new_messages.push(message.clone()),
            Some(old) if old.content != message.content => {
                changes.updated_messages.push(MessageUpdate {
                    message_id: message.message_id.clone(),
                    old_content: old.content.clone(),
                    new_content: message.content.clone(),
                });
            }
            Some(_) => {}
        }
    }

    changes.removed_messages = stored
        .iter()
        .filter(|m| !current_by_id.contains_key(&m.message_id))
        .cloned()
        .collect();

    changes
}
