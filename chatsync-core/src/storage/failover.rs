//! Routing between the privileged store and the local store
//!
//! Every call goes to the privileged backend while it is believed reachable
//! and falls back to the local backend otherwise. Transient failures only
//! affect the call at hand; channel invalidation switches the whole session to
//! local-only, and that switch is never undone.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use config::SyncSettings;

use crate::error::{StoreError, StoreResult};
use crate::retry::RetryPolicy;
use crate::storage::ids::ConversationId;
use crate::storage::implementations::remote::{StoreReply, StoreRequest};
use crate::storage::traits::{ConversationStore, PrivilegedStore};
use crate::storage::types::Conversation;
use crate::sync::adapter::StatusSink;

/// One-way `reachable -> local-only` switch shared by a page session
#[derive(Debug, Default)]
pub struct Reachability {
    local_only: AtomicBool,
}

impl Reachability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_local_only(&self) -> bool {
        self.local_only.load(Ordering::Acquire)
    }

    /// Returns true for the call that performed the switch
    fn downgrade(&self) -> bool {
        !self.local_only.swap(true, Ordering::AcqRel)
    }
}

pub struct FailoverStore {
    remote: Option<Arc<dyn PrivilegedStore>>,
    local: Arc<dyn ConversationStore>,
    reachability: Arc<Reachability>,
    liveness: RetryPolicy,
    per_call: RetryPolicy,
    status: Option<Arc<dyn StatusSink>>,
}

impl FailoverStore {
    pub fn new(
        remote: Option<Arc<dyn PrivilegedStore>>,
        local: Arc<dyn ConversationStore>,
        liveness: RetryPolicy,
        per_call: RetryPolicy,
    ) -> Self {
        Self {
            remote,
            local,
            reachability: Arc::new(Reachability::new()),
            liveness,
            per_call,
            status: None,
        }
    }

    /// Retry ladders taken from the `[sync]` settings
    pub fn from_settings(
        remote: Option<Arc<dyn PrivilegedStore>>,
        local: Arc<dyn ConversationStore>,
        settings: &SyncSettings,
    ) -> Self {
        Self::new(remote, local, settings.liveness.into(), settings.per_call.into())
    }

    /// Share the reachability switch with other stores of the same session
    pub fn with_reachability(mut self, reachability: Arc<Reachability>) -> Self {
        self.reachability = reachability;
        self
    }

    /// Where the one-time downgrade notice goes
    pub fn with_status_sink(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = Some(status);
        self
    }

    fn downgrade(&self, reason: &StoreError) {
        if self.reachability.downgrade() {
            tracing::warn!(
                "privileged store lost ({}); using local store for the rest of the session",
                reason
            );
            if let Some(status) = &self.status {
                status.notify_downgraded();
            }
        }
    }

    /// Poll the liveness id, waiting between tries. A channel that never
    /// answers is treated as invalidated.
    async fn check_liveness(&self, remote: &dyn PrivilegedStore) -> StoreResult<()> {
        self.liveness
            .retry(
                "privileged store liveness",
                move |_| async move {
                    remote.liveness_id().map(|_| ()).ok_or_else(|| {
                        StoreError::ChannelInvalidated("liveness check failed".to_string())
                    })
                },
                |_| true,
            )
            .await
    }

    async fn call_remote(
        &self,
        remote: &dyn PrivilegedStore,
        request: &StoreRequest,
    ) -> StoreResult<StoreReply> {
        self.check_liveness(remote).await?;
        self.per_call
            .retry(
                request.name(),
                move |_| request.dispatch(remote),
                StoreError::is_transient,
            )
            .await
    }

    async fn route(&self, request: StoreRequest) -> StoreResult<StoreReply> {
        let remote = self.remote.as_deref().filter(|_| !self.is_local_only());
        if let Some(remote) = remote {
            match self.call_remote(remote, &request).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_fatal() => self.downgrade(&e),
                Err(e) => {
                    tracing::warn!(
                        "{} failed on privileged store ({}); using local store for this call",
                        request.name(),
                        e
                    );
                }
            }
        }

        request
            .dispatch(self.local.as_ref())
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("{} failed on local store: {}", request.name(), e))
            })
    }
}

#[async_trait]
impl ConversationStore for FailoverStore {
    async fn create(&self, conversation: &Conversation) -> StoreResult<()> {
        self.route(StoreRequest::Create(conversation.clone()))
            .await?
            .into_done()
    }

    async fn update(&self, conversation: &Conversation) -> StoreResult<()> {
        self.route(StoreRequest::Update(conversation.clone()))
            .await?
            .into_done()
    }

    async fn get_by_id(&self, id: &ConversationId) -> StoreResult<Option<Conversation>> {
        self.route(StoreRequest::GetById(id.clone())).await?.into_one()
    }

    async fn get_by_link(&self, link: &str) -> StoreResult<Option<Conversation>> {
        self.route(StoreRequest::GetByLink(link.to_string()))
            .await?
            .into_one()
    }

    async fn get_by_external_id(
        &self,
        platform: &str,
        external_id: &str,
    ) -> StoreResult<Option<Conversation>> {
        self.route(StoreRequest::GetByExternalId {
            platform: platform.to_string(),
            external_id: external_id.to_string(),
        })
        .await?
        .into_one()
    }

    async fn delete(&self, id: &ConversationId) -> StoreResult<()> {
        self.route(StoreRequest::Delete(id.clone())).await?.into_done()
    }

    async fn list_all(&self) -> StoreResult<Vec<Conversation>> {
        self.route(StoreRequest::ListAll).await?.into_many()
    }

    fn force_local(&self) {
        self.downgrade(&StoreError::Unavailable(
            "startup retries exhausted".to_string(),
        ));
    }
    fn is_local_only(&self) -> bool {
        self.reachability.is_local_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::implementations::memory::MemoryConversationStore;
    use crate::storage::types::Message;
    use crate::test_support::{FlakyRemote, RecordingSink};
    use std::time::Duration;

    fn policies() -> (RetryPolicy, RetryPolicy) {
        (
            RetryPolicy::capped(3, Duration::from_millis(500), Duration::from_millis(3000)),
            RetryPolicy::linear(3, Duration::from_millis(500)),
        )
    }

    fn sample() -> Conversation {
        Conversation::new("p", "https://x/chat/1", None, "t", vec![Message::user(0, "hi")])
    }

    fn failover(remote: Arc<FlakyRemote>, local: Arc<MemoryConversationStore>) -> FailoverStore {
        let (liveness, per_call) = policies();
        FailoverStore::new(Some(remote), local, liveness, per_call)
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_remote_serves_calls() {
        let remote = Arc::new(FlakyRemote::new());
        let local = Arc::new(MemoryConversationStore::new());
        let store = failover(remote.clone(), local.clone());

        store.create(&sample()).await.unwrap();

        assert_eq!(remote.backend.len(), 1);
        assert!(local.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_then_falls_back_once() {
        let remote = Arc::new(FlakyRemote::new());
        remote.fail_transient(3);
        let local = Arc::new(MemoryConversationStore::new());
        let store = failover(remote.clone(), local.clone());

        let started = tokio::time::Instant::now();
        store.create(&sample()).await.unwrap();

        // Three remote attempts (500ms + 1000ms between them), then local
        assert_eq!(remote.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
        assert_eq!(local.len(), 1);
        assert!(!store.is_local_only());

        // The next call goes back to the remote
        store.create(&sample()).await.unwrap();
        assert_eq!(remote.backend.len(), 1);
        assert_eq!(remote.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovered_within_retries() {
        let remote = Arc::new(FlakyRemote::new());
        remote.fail_transient(2);
        let local = Arc::new(MemoryConversationStore::new());
        let store = failover(remote.clone(), local.clone());

        store.create(&sample()).await.unwrap();
        assert_eq!(remote.backend.len(), 1);
        assert!(local.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_downgrades_permanently() {
        let remote = Arc::new(FlakyRemote::new());
        remote.invalidate();
        let local = Arc::new(MemoryConversationStore::new());
        let sink = Arc::new(RecordingSink::default());
        let (liveness, per_call) = policies();
        let store = FailoverStore::new(Some(remote.clone()), local.clone(), liveness, per_call)
            .with_status_sink(sink.clone());

        store.create(&sample()).await.unwrap();
        assert!(store.is_local_only());
        assert_eq!(local.len(), 1);

        // Even once the channel comes back, the session stays local
        remote.revive();
        let calls_before = remote.calls();
        let liveness_before = remote.liveness_checks();
        store.list_all().await.unwrap();
        store.create(&sample()).await.unwrap();
        assert_eq!(remote.calls(), calls_before);
        assert_eq!(remote.liveness_checks(), liveness_before);
        assert_eq!(local.len(), 2);
        assert_eq!(sink.downgrades(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_call_error_downgrades_without_retry() {
        let remote = Arc::new(FlakyRemote::new());
        remote.fail_fatal_calls();
        let local = Arc::new(MemoryConversationStore::new());
        let store = failover(remote.clone(), local.clone());

        store.create(&sample()).await.unwrap();
        assert_eq!(remote.calls(), 1);
        assert!(store.is_local_only());
        assert_eq!(local.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_is_checked_with_capped_backoff() {
        let remote = Arc::new(FlakyRemote::new());
        remote.invalidate();
        let local = Arc::new(MemoryConversationStore::new());
        let store = failover(remote.clone(), local);

        let started = tokio::time::Instant::now();
        store.list_all().await.unwrap();
        assert_eq!(remote.liveness_checks(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
        assert_eq!(remote.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_remote_uses_local() {
        let local = Arc::new(MemoryConversationStore::new());
        let (liveness, per_call) = policies();
        let store = FailoverStore::new(None, local.clone(), liveness, per_call);

        store.create(&sample()).await.unwrap();
        assert_eq!(local.len(), 1);
    }

    #[tokio::test]
    async fn test_force_local_is_one_way() {
        let remote = Arc::new(FlakyRemote::new());
        let local = Arc::new(MemoryConversationStore::new());
        let store = failover(remote.clone(), local.clone());

        store.force_local();
        store.create(&sample()).await.unwrap();
        assert_eq!(remote.calls(), 0);
        assert_eq!(local.len(), 1);
    }

    #[tokio::test]
    async fn test_shared_reachability() {
        let reachability = Arc::new(Reachability::new());
        let (liveness, per_call) = policies();
        let a = FailoverStore::new(
            Some(Arc::new(FlakyRemote::new())),
            Arc::new(MemoryConversationStore::new()),
            liveness,
            per_call,
        )
        .with_reachability(reachability.clone());
        let b = FailoverStore::new(
            Some(Arc::new(FlakyRemote::new())),
            Arc::new(MemoryConversationStore::new()),
            liveness,
            per_call,
        )
        .with_reachability(reachability.clone());

        a.force_local();
        assert!(b.is_local_only());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_failure_is_storage_unavailable() {
        let remote = Arc::new(FlakyRemote::new());
        remote.invalidate();
        let local = Arc::new(FlakyRemote::new());
        local.fail_transient(u32::MAX);
        let (liveness, per_call) = policies();
        let store = FailoverStore::new(Some(remote), local, liveness, per_call);

        let err = store.list_all().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)), "unexpected error: {err}");
    }
}
