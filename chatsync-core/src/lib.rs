//! Conversation capture and incremental sync for chat web applications
//!
//! This crate provides:
//! - **Storage**: `ConversationStore` trait with `SqliteStore`, `MemoryConversationStore`
//!   and `RemoteStore` backends, combined by `FailoverStore`
//! - **Identity**: `IdentityResolver` and `CreationArbiter`, mapping a page to
//!   exactly one stored conversation
//! - **Engine**: `SyncEngine`, which attaches to a page and keeps its stored
//!   copy current as the page changes
//!
//! Page access goes through the `PlatformAdapter` trait, implemented per chat
//! site outside this crate.
//!
//! # Example
//!
//! ```ignore
//! use chatsync_core::{SyncEngine, SqliteStore, LogStatusSink};
//!
//! let store = Arc::new(SqliteStore::open("conversations.db"));
//! let engine = SyncEngine::new(adapter, store, Arc::new(LogStatusSink), &settings.sync);
//! engine.run(&url, navigations).await;
//! ```
pub mod error;
pub mod retry;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use error::{StoreError, StoreResult, SyncError, SyncResult};
pub use retry::RetryPolicy;
pub use storage::{
    ConversationId, ConversationStore, Conversation, FailoverStore, MemoryConversationStore,
    Message, MessageId, PrivilegedStore, Reachability, RemoteStore, Sender, StoreHost,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
pub use sync::{
    ChangeSet, CreationArbiter, CreationLocks, IdentityResolver, LogStatusSink, PageIdentity,
    PlatformAdapter, StatusSink, SyncEngine, SyncOutcome, SyncState,
};
