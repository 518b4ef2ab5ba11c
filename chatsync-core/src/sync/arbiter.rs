//! Find-or-create, exactly once per URL key
//!
//! Concurrent callers for the same `UrlKey` share one pending operation. A
//! call for a different key replaces the pending slot. The replaced operation
//! stops reading the page at its next extraction attempt: the page now shows
//! another conversation, and its messages must not land under the old link.
//! Creation itself happens under a per-key lock, after a second lookup that
//! catches conversations created by someone else while we were extracting and
//! resolving.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;
use crate::storage::ids::ConversationId;
use crate::storage::traits::ConversationStore;
use crate::storage::types::{derive_title, Conversation, Message};
use crate::sync::adapter::PlatformAdapter;
use crate::sync::keys::UrlKey;
use crate::sync::resolver::{IdentityResolver, PageIdentity};

type PendingResult = Shared<BoxFuture<'static, SyncResult<Option<ConversationId>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-key creation locks. Arbiters that share one (say, two tabs talking to
/// the same store) never create the same conversation twice.
#[derive(Clone, Default)]
pub struct CreationLocks {
    locks: Arc<Mutex<HashMap<UrlKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl CreationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn for_key(&self, key: &UrlKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock(&self.locks);
        // Drop locks nobody is holding or waiting on
        locks.retain(|_, l| Arc::strong_count(l) > 1);
        Arc::clone(locks.entry(key.clone()).or_default())
    }
}

struct Pending {
    key: UrlKey,
    ticket: u64,
    result: PendingResult,
}

struct ArbiterInner {
    store: Arc<dyn ConversationStore>,
    resolver: IdentityResolver,
    extraction: RetryPolicy,
    locks: CreationLocks,
    pending: Mutex<Option<Pending>>,
    next_ticket: AtomicU64,
}

#[derive(Clone)]
pub struct CreationArbiter {
    inner: Arc<ArbiterInner>,
}

/// Outcome of one extraction attempt that is worth another try
enum ExtractMiss {
    NoContentYet,
    /// The slot moved on to another key; the page is no longer ours to read
    Superseded,
    Failed(SyncError),
}

impl fmt::Display for ExtractMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractMiss::NoContentYet => f.write_str("page has no messages yet"),
            ExtractMiss::Superseded => f.write_str("superseded by another page"),
            ExtractMiss::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl CreationArbiter {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        resolver: IdentityResolver,
        extraction: RetryPolicy,
    ) -> Self {
        Self::with_locks(store, resolver, extraction, CreationLocks::new())
    }

    pub fn with_locks(
        store: Arc<dyn ConversationStore>,
        resolver: IdentityResolver,
        extraction: RetryPolicy,
        locks: CreationLocks,
    ) -> Self {
        Self {
            inner: Arc::new(ArbiterInner {
                store,
                resolver,
                extraction,
                locks,
                pending: Mutex::new(None),
                next_ticket: AtomicU64::new(0),
            }),
        }
    }

    /// Conversation id owning `page`, creating the conversation if needed.
    ///
    /// `Ok(None)` means there is nothing to capture: the page never showed
    /// any messages, or the operation was superseded before it did.
    pub async fn find_or_create(
        &self,
        page: PageIdentity,
        adapter: Arc<dyn PlatformAdapter>,
    ) -> SyncResult<Option<ConversationId>> {
        let result = self.pending_for(page, adapter);
        result.await
    }

    /// Let go of the pending operation, if any. Called when the page context
    /// leaves its key; the operation finds out before its next extraction.
    pub fn abandon(&self) {
        if let Some(old) = lock(&self.inner.pending).take() {
            tracing::debug!("abandoned pending creation for {}", old.key);
        }
    }

    /// Key of the operation currently accepting joiners
    pub fn pending_key(&self) -> Option<UrlKey> {
        lock(&self.inner.pending).as_ref().map(|p| p.key.clone())
    }

    fn pending_for(&self, page: PageIdentity, adapter: Arc<dyn PlatformAdapter>) -> PendingResult {
        let key = page.url_key();
        let mut pending = lock(&self.inner.pending);

        if let Some(current) = pending.as_ref() {
            if current.key == key {
                tracing::debug!("joining pending creation for {}", key);
                return current.result.clone();
            }
            tracing::debug!("{} supersedes pending creation for {}", key, current.key);
        }

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = inner.run(ticket, &page, adapter.as_ref()).await;
            inner.finish(&task_key, ticket);
            result
        });

        let result = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(SyncError::Aborted(e.to_string())))
        }
        .boxed()
        .shared();

        *pending = Some(Pending {
            key,
            ticket,
            result: result.clone(),
        });
        result
    }
}

impl ArbiterInner {
    fn owns_slot(&self, ticket: u64) -> bool {
        lock(&self.pending).as_ref().is_some_and(|p| p.ticket == ticket)
    }

    fn finish(&self, key: &UrlKey, ticket: u64) {
        let mut pending = lock(&self.pending);
        if pending.as_ref().is_some_and(|p| p.ticket == ticket) {
            *pending = None;
            tracing::debug!("pending creation for {} settled", key);
        }
    }

    async fn run(
        &self,
        ticket: u64,
        page: &PageIdentity,
        adapter: &dyn PlatformAdapter,
    ) -> SyncResult<Option<ConversationId>> {
        let messages = match self.extract(ticket, adapter).await? {
            Extracted::Messages(messages) => messages,
            Extracted::Empty => {
                tracing::info!("no messages on {}; nothing to capture", page.link());
                return Ok(None);
            }
            Extracted::Superseded => {
                tracing::info!("left {} before it rendered; nothing captured", page.link());
                return Ok(None);
            }
        };

        if let Some(id) = self.resolver.resolve(page).await? {
            return Ok(Some(id));
        }

        let key = page.url_key();
        let creation_lock = self.locks.for_key(&key);
        let _guard = creation_lock.lock().await;

        // Someone may have created it while we were extracting or waiting
        if let Some(id) = self.resolver.resolve_by_link(page).await? {
            tracing::info!("{} appeared for {} before insert; reusing it", id, key);
            return Ok(Some(id));
        }

        let title = adapter
            .extract_title()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| derive_title(&messages));
        let conversation = Conversation::new(
            page.platform.clone(),
            page.link(),
            self.resolver.external_id(page).map(str::to_string),
            title,
            messages,
        );
        self.store.create(&conversation).await?;

        tracing::info!(
            "created {} for {} with {} messages",
            conversation.conversation_id,
            key,
            conversation.messages.len()
        );
        Ok(Some(conversation.conversation_id))
    }

    /// Messages on the page, waiting for the first render. Every attempt
    /// first checks that this operation still owns the slot.
    async fn extract(&self, ticket: u64, adapter: &dyn PlatformAdapter) -> SyncResult<Extracted> {
        let inner = self;
        let outcome = self
            .extraction
            .retry(
                "message extraction",
                move |_| async move {
                    if !inner.owns_slot(ticket) {
                        return Err(ExtractMiss::Superseded);
                    }
                    match adapter.extract_messages() {
                        Ok(messages) if messages.is_empty() => Err(ExtractMiss::NoContentYet),
                        Ok(messages) => Ok(messages),
                        Err(e) => Err(ExtractMiss::Failed(SyncError::Extraction(format!("{e:#}")))),
                    }
                },
                |miss| matches!(miss, ExtractMiss::NoContentYet),
            )
            .await;

        match outcome {
            Ok(messages) => Ok(Extracted::Messages(messages)),
            Err(ExtractMiss::NoContentYet) => Ok(Extracted::Empty),
            Err(ExtractMiss::Superseded) => Ok(Extracted::Superseded),
            Err(ExtractMiss::Failed(e)) => Err(e),
        }
    }
}

enum Extracted {
    Messages(Vec<Message>),
    Empty,
    Superseded,
}
