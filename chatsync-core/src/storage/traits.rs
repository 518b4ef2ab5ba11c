//! Storage trait definitions
//!
//! `ConversationStore` is the one capability the sync engine talks to. The
//! remote, sqlite and in-memory backends implement it, and so does
//! `FailoverStore`, which routes between a privileged and a local backend.

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::storage::ids::ConversationId;
use crate::storage::types::Conversation;

/// Persisted conversations, keyed by `conversation_id`
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Insert a new record. Inserting an id that already exists is a no-op,
    /// so a create retried after a lost reply does not fail.
    async fn create(&self, conversation: &Conversation) -> StoreResult<()>;

    /// Write the whole record, inserting it if this backend has not seen it
    async fn update(&self, conversation: &Conversation) -> StoreResult<()>;

    async fn get_by_id(&self, id: &ConversationId) -> StoreResult<Option<Conversation>>;

    /// Lookup by query-stripped URL. Several records may share a link; the
    /// most recently updated one wins.
    async fn get_by_link(&self, link: &str) -> StoreResult<Option<Conversation>>;

    /// Lookup by the platform's own conversation id
    async fn get_by_external_id(
        &self,
        platform: &str,
        external_id: &str,
    ) -> StoreResult<Option<Conversation>>;

    async fn delete(&self, id: &ConversationId) -> StoreResult<()>;

    /// Every conversation, most recently active first
    async fn list_all(&self) -> StoreResult<Vec<Conversation>>;

    /// Stop using any privileged backend for the rest of the session.
    /// Backends without one ignore this.
    fn force_local(&self) {}

    /// True once every call goes to the local backend for good
    fn is_local_only(&self) -> bool {
        false
    }
}

/// A backend reached over a channel that can disappear underneath us.
pub trait PrivilegedStore: ConversationStore {
    /// Identity of the process on the other end, or `None` once the channel
    /// is structurally gone.
    fn liveness_id(&self) -> Option<String>;
}
