//! Collaborator contracts consumed by the sync engine
//!
//! The engine never looks at a page directly. A `PlatformAdapter` knows how a
//! particular chat site lays out its messages; a `StatusSink` shows the user
//! whether the last save worked.

use anyhow::Result;
use futures::stream::BoxStream;

use crate::storage::types::Message;

/// What a platform's URL says about the conversation on screen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationInfo {
    /// Platform-native id (external id), when the URL carries one
    pub conversation_id: Option<String>,
    /// The page is a fresh chat that the platform has not assigned an id to
    pub is_new_conversation: bool,
}

/// Per-platform page access
pub trait PlatformAdapter: Send + Sync {
    /// Platform name stored on every conversation (e.g. "chatgpt")
    fn platform(&self) -> &str;

    /// Messages currently rendered, in page order. Empty while the page is
    /// still loading.
    fn extract_messages(&self) -> Result<Vec<Message>>;

    fn extract_title(&self) -> Option<String>;

    fn is_valid_conversation_url(&self, url: &str) -> bool;

    fn extract_conversation_info(&self, url: &str) -> ConversationInfo;

    /// The user is typing into an editable control inside the conversation
    fn is_editing(&self) -> bool {
        false
    }

    /// Raw mutation notifications for the conversation container. Dropping
    /// the stream stops the observation.
    fn mutations(&self) -> BoxStream<'static, ()>;
}

/// Fire-and-forget save indicator
pub trait StatusSink: Send + Sync {
    fn notify_success(&self);

    fn notify_error(&self, message: &str);

    /// The privileged store went away and the session now saves locally.
    /// Called at most once per session.
    fn notify_downgraded(&self) {}
}

/// Sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn notify_success(&self) {
        tracing::debug!("conversation saved");
    }

    fn notify_error(&self, message: &str) {
        tracing::error!("conversation save failed: {}", message);
    }

    fn notify_downgraded(&self) {
        tracing::warn!("saving to the local store only");
    }
}
