//! Concrete `ConversationStore` backends

pub mod memory;
pub mod remote;
#[cfg(feature = "sqlite")]
pub mod sqlite;
