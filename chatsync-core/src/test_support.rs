//! Scripted collaborators shared by the unit tests

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{StoreError, StoreResult};
use crate::storage::ids::ConversationId;
use crate::storage::implementations::memory::MemoryConversationStore;
use crate::storage::traits::{ConversationStore, PrivilegedStore};
use crate::storage::types::{Conversation, Message};
use crate::sync::adapter::{ConversationInfo, PlatformAdapter, StatusSink};
use crate::sync::keys::strip_query;

/// Let spawned tasks run to their next suspension point
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Privileged store double that can be told to misbehave
pub(crate) struct FlakyRemote {
    pub backend: MemoryConversationStore,
    transient_failures: AtomicU32,
    invalidated: AtomicBool,
    fatal_calls: AtomicBool,
    calls: AtomicU32,
    liveness_checks: AtomicU32,
}

impl FlakyRemote {
    pub fn new() -> Self {
        Self {
            backend: MemoryConversationStore::new(),
            transient_failures: AtomicU32::new(0),
            invalidated: AtomicBool::new(false),
            fatal_calls: AtomicBool::new(false),
            calls: AtomicU32::new(0),
            liveness_checks: AtomicU32::new(0),
        }
    }

    /// The next `n` calls time out
    pub fn fail_transient(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Liveness disappears and calls report an invalidated channel
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    pub fn revive(&self) {
        self.invalidated.store(false, Ordering::SeqCst);
        self.fatal_calls.store(false, Ordering::SeqCst);
    }

    /// Liveness still answers, but every call reports an invalidated channel
    pub fn fail_fatal_calls(&self) {
        self.fatal_calls.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn liveness_checks(&self) -> u32 {
        self.liveness_checks.load(Ordering::SeqCst)
    }

    fn enter(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.invalidated.load(Ordering::SeqCst) || self.fatal_calls.load(Ordering::SeqCst) {
            return Err(StoreError::ChannelInvalidated("extension reloaded".to_string()));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Transient("timed out".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for FlakyRemote {
    async fn create(&self, conversation: &Conversation) -> StoreResult<()> {
        self.enter()?;
        self.backend.create(conversation).await
    }

    async fn update(&self, conversation: &Conversation) -> StoreResult<()> {
        self.enter()?;
        self.backend.update(conversation).await
    }

    async fn get_by_id(&self, id: &ConversationId) -> StoreResult<Option<Conversation>> {
        self.enter()?;
        self.backend.get_by_id(id).await
    }

    async fn get_by_link(&self, link: &str) -> StoreResult<Option<Conversation>> {
        self.enter()?;
        self.backend.get_by_link(link).await
    }

    async fn get_by_external_id(
        &self,
        platform: &str,
        external_id: &str,
    ) -> StoreResult<Option<Conversation>> {
        self.enter()?;
        self.backend.get_by_external_id(platform, external_id).await
    }

    async fn delete(&self, id: &ConversationId) -> StoreResult<()> {
        self.enter()?;
        self.backend.delete(id).await
    }

    async fn list_all(&self) -> StoreResult<Vec<Conversation>> {
        self.enter()?;
        self.backend.list_all().await
    }
}

impl PrivilegedStore for FlakyRemote {
    fn liveness_id(&self) -> Option<String> {
        self.liveness_checks.fetch_add(1, Ordering::SeqCst);
        if self.invalidated.load(Ordering::SeqCst) {
            None
        } else {
            Some("flaky-remote".to_string())
        }
    }
}

/// Status sink that counts what it was told
#[derive(Default)]
pub(crate) struct RecordingSink {
    successes: AtomicUsize,
    errors: Mutex<Vec<String>>,
    downgrades: AtomicUsize,
}

impl RecordingSink {
    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn downgrades(&self) -> usize {
        self.downgrades.load(Ordering::SeqCst)
    }
}

impl StatusSink for RecordingSink {
    fn notify_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn notify_downgraded(&self) {
        self.downgrades.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Page {
    messages: Vec<Message>,
    title: Option<String>,
    empty_reads: usize,
    failing: bool,
    editing: bool,
    external_ids: HashMap<String, String>,
    invalid: Vec<String>,
}

/// Page double: its content is set by the test, mutations are pushed by hand
pub(crate) struct ScriptedAdapter {
    platform: String,
    page: Mutex<Page>,
    extractions: AtomicUsize,
    observers: Mutex<Vec<mpsc::UnboundedSender<()>>>,
}

impl ScriptedAdapter {
    pub fn new(platform: &str, messages: Vec<Message>) -> Self {
        Self {
            platform: platform.to_string(),
            page: Mutex::new(Page {
                messages,
                ..Page::default()
            }),
            extractions: AtomicUsize::new(0),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_messages(&self, messages: Vec<Message>) {
        self.page.lock().unwrap().messages = messages;
    }

    pub fn set_title(&self, title: Option<&str>) {
        self.page.lock().unwrap().title = title.map(str::to_string);
    }

    /// The next `n` extractions find an empty page
    pub fn render_after(&self, n: usize) {
        self.page.lock().unwrap().empty_reads = n;
    }

    pub fn fail_extraction(&self, failing: bool) {
        self.page.lock().unwrap().failing = failing;
    }

    pub fn set_editing(&self, editing: bool) {
        self.page.lock().unwrap().editing = editing;
    }

    pub fn assign_external_id(&self, url: &str, external_id: &str) {
        self.page
            .lock()
            .unwrap()
            .external_ids
            .insert(strip_query(url), external_id.to_string());
    }

    pub fn mark_invalid(&self, url: &str) {
        self.page.lock().unwrap().invalid.push(strip_query(url));
    }

    pub fn extractions(&self) -> usize {
        self.extractions.load(Ordering::SeqCst)
    }

    /// Push one raw mutation to every live observer
    pub fn mutate(&self) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|tx| tx.send(()).is_ok());
    }

    pub fn live_observers(&self) -> usize {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|tx| !tx.is_closed());
        observers.len()
    }
}

impl PlatformAdapter for ScriptedAdapter {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn extract_messages(&self) -> anyhow::Result<Vec<Message>> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        let mut page = self.page.lock().unwrap();
        if page.failing {
            anyhow::bail!("conversation container not found");
        }
        if page.empty_reads > 0 {
            page.empty_reads -= 1;
            return Ok(Vec::new());
        }
        Ok(page.messages.clone())
    }

    fn extract_title(&self) -> Option<String> {
        self.page.lock().unwrap().title.clone()
    }

    fn is_valid_conversation_url(&self, url: &str) -> bool {
        !self.page.lock().unwrap().invalid.contains(&strip_query(url))
    }

    fn extract_conversation_info(&self, url: &str) -> ConversationInfo {
        let conversation_id = self
            .page
            .lock()
            .unwrap()
            .external_ids
            .get(&strip_query(url))
            .cloned();
        ConversationInfo {
            is_new_conversation: conversation_id.is_none(),
            conversation_id,
        }
    }

    fn is_editing(&self) -> bool {
        self.page.lock().unwrap().editing
    }

    fn mutations(&self) -> BoxStream<'static, ()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.lock().unwrap().push(tx);
        UnboundedReceiverStream::new(rx).boxed()
    }
}
