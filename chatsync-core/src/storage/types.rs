//! Stored record shapes: conversations and their messages

use serde::{Deserialize, Serialize};

use super::helper::unix_timestamp;
use super::ids::{ConversationId, MessageId};

/// Longest title derived from a message before it gets cut
const DERIVED_TITLE_MAX_CHARS: usize = 80;

pub const UNTITLED: &str = "Untitled conversation";

/// Who wrote a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Ai => "ai",
        }
    }
}

/// One message as captured from the page
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: MessageId,
    pub sender: Sender,
    pub content: String,
    /// Model reasoning trace, when the platform shows one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Index in the extracted sequence at capture time
    pub position: usize,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Message {
    /// Build a freshly extracted message; the id follows from sender and position.
    pub fn new(sender: Sender, position: usize, content: impl Into<String>) -> Self {
        let now = unix_timestamp();
        Self {
            message_id: MessageId::derive(sender, position),
            sender,
            content: content.into(),
            thinking: None,
            position,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn user(position: usize, content: impl Into<String>) -> Self {
        Self::new(Sender::User, position, content)
    }

    pub fn ai(position: usize, content: impl Into<String>) -> Self {
        Self::new(Sender::Ai, position, content)
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = Some(thinking.into());
        self
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.created_at = timestamp;
        self.updated_at = timestamp;
        self
    }
}

/// A captured conversation.
///
/// `conversation_id` is assigned once at creation and never changes. `link`
/// is the query-stripped page URL as of the last write. `external_id` is the
/// platform's own identifier and wins over `link` when resolving identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub external_id: Option<String>,
    pub link: String,
    pub title: String,
    pub platform: String,
    pub messages: Vec<Message>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    /// New record with a freshly generated id
    pub fn new(
        platform: impl Into<String>,
        link: impl Into<String>,
        external_id: Option<String>,
        title: impl Into<String>,
        messages: Vec<Message>,
    ) -> Self {
        let now = unix_timestamp();
        Self {
            conversation_id: ConversationId::new(),
            external_id,
            link: link.into(),
            title: title.into(),
            platform: platform.into(),
            messages,
            created_at: now,
            updated_at: now,
        }
    }

    /// Time of the most recent activity: the last message if there is one,
    /// otherwise the record's own update (or creation) time.
    pub fn last_activity(&self) -> i64 {
        match self.messages.last() {
            Some(message) => message.updated_at,
            None => self.updated_at.max(self.created_at),
        }
    }

    /// Replace the whole message list with a fresh snapshot.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = unix_timestamp().max(self.updated_at);
    }
}

/// Sort most recently active first
pub fn sort_by_last_activity(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
}

/// Title taken from the first user message, whitespace collapsed and cut to length
pub fn derive_title(messages: &[Message]) -> String {
    let Some(first) = messages
        .iter()
        .find(|m| m.sender == Sender::User && !m.content.trim().is_empty())
    else {
        return UNTITLED.to_string();
    };

    let collapsed = first.content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= DERIVED_TITLE_MAX_CHARS {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(DERIVED_TITLE_MAX_CHARS).collect();
    format!("{}...", cut.trim_end())
}
