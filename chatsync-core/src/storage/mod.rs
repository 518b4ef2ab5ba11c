//! Storage abstractions for captured conversations
//!
//! Backends, all implementing `ConversationStore`:
//!
//! - `RemoteStore` - client of a privileged `StoreHost` task
//! - `SqliteStore` - local embedded store (requires `sqlite` feature)
//! - `MemoryConversationStore` - in-memory, no persistence
//!
//! `FailoverStore` combines a privileged and a local backend behind the same
//! trait.

pub mod failover;
pub mod helper;
pub mod ids;
pub mod implementations;
pub mod traits;
pub mod types;

pub use failover::{FailoverStore, Reachability};
pub use ids::{ConversationId, MessageId};
pub use implementations::memory::MemoryConversationStore;
pub use implementations::remote::{RemoteStore, StoreHost, StoreReply, StoreRequest};
#[cfg(feature = "sqlite")]
pub use implementations::sqlite::SqliteStore;
pub use traits::{ConversationStore, PrivilegedStore};
pub use types::{Conversation, Message, Sender};
