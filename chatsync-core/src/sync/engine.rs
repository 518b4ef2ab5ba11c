//! Page lifecycle: resolve, attach, observe, re-sync
//!
//! One `SyncEngine` drives one page context. It is owned by a single task and
//! processes one event at a time, so its state needs no locking; the
//! concurrency hazards live in the arbiter and the stores. Resolution is the
//! one long-running step, so `run` keeps it in flight next to the navigation
//! stream and drops it when the page moves to another key.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use config::SyncSettings;

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;
use crate::storage::ids::ConversationId;
use crate::storage::traits::ConversationStore;
use crate::storage::types::{derive_title, Conversation, Message};
use crate::sync::adapter::{PlatformAdapter, StatusSink};
use crate::sync::arbiter::{CreationArbiter, CreationLocks};
use crate::sync::changeset::{diff, ChangeSet};
use crate::sync::detector::ChangeDetector;
use crate::sync::keys::{PlaceholderIds, UrlKey};
use crate::sync::resolver::{IdentityResolver, PageIdentity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Resolving,
    Attached(ConversationId),
    Observing(ConversationId),
    /// The user is editing; writes wait for a signal that finds them done
    Suspended(ConversationId),
}

impl SyncState {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            SyncState::Attached(id) | SyncState::Observing(id) | SyncState::Suspended(id) => {
                Some(id)
            }
            SyncState::Idle | SyncState::Resolving => None,
        }
    }
}

/// What one sync of the page against its stored conversation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Written(ChangeSet),
    Unchanged,
    /// The page showed no messages; nothing was written
    NoContent,
    /// Skipped because the user is editing
    Suspended,
    /// The attached conversation no longer exists in the store
    Missing,
}

/// Timing knobs of the engine itself
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub debounce: Duration,
    pub boot: RetryPolicy,
}

impl From<&SyncSettings> for SyncOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            debounce: settings.debounce(),
            boot: settings.boot.into(),
        }
    }
}

/// A resolve-and-attach in flight, tagged with the key it was started for
type Resolution = BoxFuture<'static, (UrlKey, SyncResult<Option<ConversationId>>)>;

enum Event {
    Navigated(String),
    NavigationEnded,
    Changed,
    ObservationEnded,
    Resolved(UrlKey, SyncResult<Option<ConversationId>>),
}

pub struct SyncEngine {
    adapter: Arc<dyn PlatformAdapter>,
    store: Arc<dyn ConversationStore>,
    status: Arc<dyn StatusSink>,
    resolver: IdentityResolver,
    arbiter: CreationArbiter,
    extraction: RetryPolicy,
    options: SyncOptions,
    state: SyncState,
    page: Option<PageIdentity>,
    detector: Option<ChangeDetector>,
    /// Last record read or written for the attached conversation
    known: Option<Conversation>,
    /// Attached while the privileged store was still in use, so the local
    /// store may not hold the record yet
    attached_remotely: bool,
}

impl SyncEngine {
    pub fn new(
        adapter: Arc<dyn PlatformAdapter>,
        store: Arc<dyn ConversationStore>,
        status: Arc<dyn StatusSink>,
        settings: &SyncSettings,
    ) -> Self {
        let resolver = IdentityResolver::new(
            Arc::clone(&store),
            PlaceholderIds::new(settings.placeholder_ids.iter().cloned()),
        );
        let extraction = RetryPolicy::from(settings.extraction);
        let arbiter = CreationArbiter::new(Arc::clone(&store), resolver.clone(), extraction);

        Self {
            adapter,
            store,
            status,
            resolver,
            arbiter,
            extraction,
            options: SyncOptions::from(settings),
            state: SyncState::Idle,
            page: None,
            detector: None,
            known: None,
            attached_remotely: false,
        }
    }

    /// Share creation locks with other engines writing to the same store
    pub fn with_creation_locks(mut self, locks: CreationLocks) -> Self {
        self.arbiter = CreationArbiter::with_locks(
            Arc::clone(&self.store),
            self.resolver.clone(),
            self.extraction,
            locks,
        );
        self
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.state.conversation_id()
    }

    pub fn url_key(&self) -> Option<UrlKey> {
        self.page.as_ref().map(PageIdentity::url_key)
    }

    pub fn is_observing(&self) -> bool {
        self.detector.is_some()
    }

    /// First resolve-and-attach for the page the engine was started on
    pub async fn start(&mut self, url: &str) {
        if let Some(resolution) = self.begin(url) {
            self.complete(resolution).await;
        }
    }

    /// URL change. Same key: nothing to do. Different key: tear down the
    /// current observation and resolve again.
    pub async fn navigate(&mut self, url: &str) {
        if self.stays_on(url) {
            return;
        }
        if let Some(resolution) = self.begin(url) {
            self.complete(resolution).await;
        }
    }

    /// One debounced change signal
    pub async fn on_change(&mut self) -> Option<SyncOutcome> {
        let (outcome, resolution) = self.handle_change().await;
        if let Some(resolution) = resolution {
            self.complete(resolution).await;
        }
        outcome
    }

    /// Extract the page and write it to `id` if anything changed
    pub async fn sync_snapshot(&mut self, id: &ConversationId) -> SyncResult<SyncOutcome> {
        let messages = self
            .adapter
            .extract_messages()
            .map_err(|e| SyncError::Extraction(format!("{e:#}")))?;
        if messages.is_empty() {
            tracing::debug!("page shows no messages; skipping sync of {}", id);
            return Ok(SyncOutcome::NoContent);
        }

        let (mut conversation, seeding) = match self.store.get_by_id(id).await? {
            Some(conversation) => (conversation, false),
            // The record lives on the privileged store we just lost
            None if self.attached_remotely && self.store.is_local_only() => {
                tracing::warn!("{} is not in the local store yet; writing it there", id);
                (self.seed_record(id, &messages), true)
            }
            None => return Ok(SyncOutcome::Missing),
        };

        let changes = diff(&conversation.messages, &messages);
        let title = self
            .adapter
            .extract_title()
            .filter(|t| !t.trim().is_empty() && *t != conversation.title);
        let link = self.page.as_ref().map(PageIdentity::link);
        let link = link.filter(|l| *l != conversation.link);
        let external_id = match (&conversation.external_id, &self.page) {
            (None, Some(page)) => self.resolver.external_id(page).map(str::to_string),
            _ => None,
        };

        if !seeding
            && changes.is_empty()
            && title.is_none()
            && link.is_none()
            && external_id.is_none()
        {
            tracing::debug!("{} is up to date", id);
            self.known = Some(conversation);
            return Ok(SyncOutcome::Unchanged);
        }

        if changes.is_empty() {
            conversation.touch();
        } else {
            conversation.replace_messages(messages);
        }
        if let Some(title) = title {
            conversation.title = title;
        }
        if let Some(link) = link {
            conversation.link = link;
        }
        if external_id.is_some() {
            conversation.external_id = external_id;
        }

        self.store.update(&conversation).await?;
        if seeding {
            self.attached_remotely = false;
        }
        tracing::info!("synced {} ({})", id, changes.summary());
        self.known = Some(conversation);
        Ok(SyncOutcome::Written(changes))
    }

    /// Drive the engine until the navigation stream ends
    pub async fn run(mut self, url: &str, mut navigations: BoxStream<'static, String>) {
        let mut resolving = self.begin(url);

        loop {
            let event = tokio::select! {
                next = navigations.next() => match next {
                    Some(url) => Event::Navigated(url),
                    None => Event::NavigationEnded,
                },
                signal = next_signal(self.detector.as_mut()) => match signal {
                    Some(()) => Event::Changed,
                    None => Event::ObservationEnded,
                },
                (key, result) = next_resolution(resolving.as_mut()) => Event::Resolved(key, result),
            };

            match event {
                Event::Navigated(url) => {
                    if !self.stays_on(&url) {
                        // Drops any resolution still running for the old key
                        resolving = self.begin(&url);
                    }
                }
                Event::Resolved(key, result) => {
                    resolving = None;
                    self.attach(key, result).await;
                }
                Event::Changed => {
                    if let (_, Some(next)) = self.handle_change().await {
                        resolving = Some(next);
                    }
                }
                Event::ObservationEnded => {
                    tracing::debug!("mutation source ended");
                    self.detector = None;
                }
                Event::NavigationEnded => break,
            }
        }

        self.teardown();
    }

    /// Stop observing and forget the current page
    pub fn teardown(&mut self) {
        if self.detector.take().is_some() {
            tracing::debug!("stopped observing {:?}", self.url_key());
        }
        self.page = None;
        self.known = None;
        self.state = SyncState::Idle;
    }

    fn report(&self, outcome: &SyncResult<SyncOutcome>) {
        match outcome {
            Ok(SyncOutcome::Written(_)) => self.status.notify_success(),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("sync failed: {}", e);
                self.status.notify_error(&e.to_string());
            }
        }
    }

    /// Same key as the current page: keep the attachment and remember the
    /// full URL for the next write
    fn stays_on(&mut self, url: &str) -> bool {
        let key = UrlKey::new(self.adapter.platform(), url);
        if self.url_key().as_ref() != Some(&key) || self.state == SyncState::Idle {
            return false;
        }
        if let Some(page) = self.page.as_mut() {
            page.url = url.to_string();
        }
        tracing::debug!("navigation within {}; staying attached", key);
        true
    }

    async fn handle_change(&mut self) -> (Option<SyncOutcome>, Option<Resolution>) {
        let id = match &self.state {
            SyncState::Observing(id) | SyncState::Suspended(id) => id.clone(),
            _ => return (None, None),
        };

        if self.adapter.is_editing() {
            if !matches!(self.state, SyncState::Suspended(_)) {
                tracing::debug!("user is editing {}; holding writes", id);
            }
            self.state = SyncState::Suspended(id);
            return (Some(SyncOutcome::Suspended), None);
        }
        self.state = SyncState::Observing(id.clone());

        let outcome = self.sync_snapshot(&id).await;
        self.report(&outcome);
        match outcome {
            Ok(SyncOutcome::Missing) => {
                tracing::warn!("{} disappeared from the store; resolving the page again", id);
                let url = self.page.as_ref().map(|p| p.url.clone());
                let resolution = url.and_then(|url| self.begin(&url));
                (Some(SyncOutcome::Missing), resolution)
            }
            Ok(outcome) => (Some(outcome), None),
            Err(_) => (None, None),
        }
    }

    /// Leave the current page and start resolving `url`. `None` when there
    /// is nothing to resolve.
    fn begin(&mut self, url: &str) -> Option<Resolution> {
        self.teardown();
        self.arbiter.abandon();
        let page = PageIdentity::from_adapter(self.adapter.as_ref(), url);
        self.page = Some(page.clone());

        if !self.adapter.is_valid_conversation_url(url) {
            tracing::debug!("{} is not a conversation page", page.link());
            return None;
        }

        self.state = SyncState::Resolving;
        let arbiter = self.arbiter.clone();
        let adapter = Arc::clone(&self.adapter);
        let store = Arc::clone(&self.store);
        let boot = self.options.boot;
        Some(
            async move {
                let result =
                    resolve_with_boot_retry(&arbiter, &adapter, store.as_ref(), boot, &page).await;
                (page.url_key(), result)
            }
            .boxed(),
        )
    }

    async fn complete(&mut self, resolution: Resolution) {
        let (key, result) = resolution.await;
        self.attach(key, result).await;
    }

    async fn attach(&mut self, key: UrlKey, result: SyncResult<Option<ConversationId>>) {
        if self.state != SyncState::Resolving || self.url_key().as_ref() != Some(&key) {
            tracing::debug!("dropping resolution for {}; the page moved on", key);
            return;
        }

        let id = match result {
            Ok(Some(id)) => id,
            Ok(None) => {
                self.state = SyncState::Idle;
                return;
            }
            Err(e) => {
                tracing::warn!("could not attach to {}: {}", key, e);
                self.status.notify_error(&e.to_string());
                self.state = SyncState::Idle;
                return;
            }
        };

        tracing::info!("attached {} to {}", key, id);
        self.state = SyncState::Attached(id.clone());
        self.attached_remotely = !self.store.is_local_only();

        let editing = self.adapter.is_editing();
        if editing {
            tracing::debug!("user is editing {}; first sync waits for a change", id);
        } else {
            let initial = self.sync_snapshot(&id).await;
            self.report(&initial);
        }

        self.detector = Some(ChangeDetector::spawn(
            self.adapter.mutations(),
            self.options.debounce,
        ));
        self.state = if editing {
            SyncState::Suspended(id)
        } else {
            SyncState::Observing(id)
        };
    }

    /// Record to write when the attached conversation only existed on the
    /// privileged store
    fn seed_record(&self, id: &ConversationId, messages: &[Message]) -> Conversation {
        if let Some(known) = self.known.as_ref().filter(|c| c.conversation_id == *id) {
            return known.clone();
        }
        let (platform, link) = match &self.page {
            Some(page) => (page.platform.clone(), page.link()),
            None => (self.adapter.platform().to_string(), String::new()),
        };
        let mut conversation =
            Conversation::new(platform, link, None, derive_title(messages), Vec::new());
        conversation.conversation_id = id.clone();
        conversation
    }
}

async fn resolve_with_boot_retry(
    arbiter: &CreationArbiter,
    adapter: &Arc<dyn PlatformAdapter>,
    store: &dyn ConversationStore,
    boot: RetryPolicy,
    page: &PageIdentity,
) -> SyncResult<Option<ConversationId>> {
    let attempt = boot
        .retry(
            "resolve and attach",
            move |_| arbiter.find_or_create(page.clone(), Arc::clone(adapter)),
            |_| true,
        )
        .await;

    match attempt {
        Ok(id) => Ok(id),
        Err(e) => {
            tracing::warn!("resolve and attach kept failing ({}); continuing on the local store", e);
            store.force_local();
            arbiter.find_or_create(page.clone(), Arc::clone(adapter)).await
        }
    }
}

async fn next_signal(detector: Option<&mut ChangeDetector>) -> Option<()> {
    match detector {
        Some(detector) => detector.changed().await,
        None => std::future::pending().await,
    }
}

async fn next_resolution(
    resolving: Option<&mut Resolution>,
) -> (UrlKey, SyncResult<Option<ConversationId>>) {
    match resolving {
        Some(resolution) => resolution.await,
        None => std::future::pending().await,
    }
}
