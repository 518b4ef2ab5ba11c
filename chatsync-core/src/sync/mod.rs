//! Keeping a stored conversation in step with a live chat page
//!
//! - `IdentityResolver` - which stored conversation a page belongs to
//! - `CreationArbiter` - find-or-create, at most once per URL key
//! - `ChangeDetector` - debounced "content may have changed" signal
//! - `SyncEngine` - the per-page lifecycle tying them together

pub mod adapter;
pub mod arbiter;
pub mod changeset;
pub mod detector;
pub mod engine;
pub mod keys;
pub mod resolver;


pub use adapter::{ConversationInfo, LogStatusSink, PlatformAdapter, StatusSink};
pub use arbiter::{CreationArbiter, CreationLocks};
pub use changeset::{diff, ChangeSet, MessageUpdate};
pub use detector::ChangeDetector;
pub use engine::{SyncEngine, SyncOptions, SyncOutcome, SyncState};
pub use keys::{strip_query, PlaceholderIds, UrlKey};
pub use resolver::{IdentityResolver, PageIdentity};
