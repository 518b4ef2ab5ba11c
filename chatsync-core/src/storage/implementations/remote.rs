//! Privileged store reached by message passing
//!
//! `StoreHost` owns a backend and serves requests from a channel on its own
//! task; `RemoteStore` is the page-side client. When the host goes away the
//! channel closes and every call reports `ChannelInvalidated`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::storage::ids::ConversationId;
use crate::storage::traits::{ConversationStore, PrivilegedStore};
use crate::storage::types::Conversation;

const CHANNEL_CAPACITY: usize = 64;

/// One store operation, as a value that can cross a channel
#[derive(Debug, Clone)]
pub enum StoreRequest {
    Create(Conversation),
    Update(Conversation),
    GetById(ConversationId),
    GetByLink(String),
    GetByExternalId { platform: String, external_id: String },
    Delete(ConversationId),
    ListAll,
}

#[derive(Debug, Clone)]
pub enum StoreReply {
    Done,
    One(Option<Conversation>),
    Many(Vec<Conversation>),
}

impl StoreRequest {
    pub fn name(&self) -> &'static str {
        match self {
            StoreRequest::Create(_) => "create",
            StoreRequest::Update(_) => "update",
            StoreRequest::GetById(_) => "get_by_id",
            StoreRequest::GetByLink(_) => "get_by_link",
            StoreRequest::GetByExternalId { .. } => "get_by_external_id",
            StoreRequest::Delete(_) => "delete",
            StoreRequest::ListAll => "list_all",
        }
    }

    /// Run the request against a concrete backend
    pub async fn dispatch<S>(&self, store: &S) -> StoreResult<StoreReply>
    where
        S: ConversationStore + ?Sized,
    {
        Ok(match self {
            StoreRequest::Create(c) => store.create(c).await.map(|_| StoreReply::Done)?,
            StoreRequest::Update(c) => store.update(c).await.map(|_| StoreReply::Done)?,
            StoreRequest::GetById(id) => StoreReply::One(store.get_by_id(id).await?),
            StoreRequest::GetByLink(link) => StoreReply::One(store.get_by_link(link).await?),
            StoreRequest::GetByExternalId {
                platform,
                external_id,
            } => StoreReply::One(store.get_by_external_id(platform, external_id).await?),
            StoreRequest::Delete(id) => store.delete(id).await.map(|_| StoreReply::Done)?,
            StoreRequest::ListAll => StoreReply::Many(store.list_all().await?),
        })
    }
}

impl StoreReply {
    pub fn into_done(self) -> StoreResult<()> {
        match self {
            StoreReply::Done => Ok(()),
            other => Err(unexpected("done", &other)),
        }
    }

    pub fn into_one(self) -> StoreResult<Option<Conversation>> {
        match self {
            StoreReply::One(c) => Ok(c),
            other => Err(unexpected("one record", &other)),
        }
    }

    pub fn into_many(self) -> StoreResult<Vec<Conversation>> {
        match self {
            StoreReply::Many(c) => Ok(c),
            other => Err(unexpected("record list", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &StoreReply) -> StoreError {
    let got = match got {
        StoreReply::Done => "done",
        StoreReply::One(_) => "one record",
        StoreReply::Many(_) => "record list",
    };
    StoreError::Protocol(format!("expected {wanted}, got {got}"))
}

struct Envelope {
    request: StoreRequest,
    reply: oneshot::Sender<StoreResult<StoreReply>>,
}

/// Serves store requests for page-side clients
pub struct StoreHost;

impl StoreHost {
    /// Spawn a host task over `store` and return a connected client.
    ///
    /// The host runs until every client is dropped or the handle is aborted.
    pub fn spawn(
        store: Arc<dyn ConversationStore>,
        timeout: Duration,
    ) -> (RemoteStore, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);
        let host_id = Uuid::new_v4().to_string();
        let id_for_task = host_id.clone();

        let handle = tokio::spawn(async move {
            tracing::debug!("store host {} started", id_for_task);
            while let Some(Envelope { request, reply }) = rx.recv().await {
                let result = request.dispatch(store.as_ref()).await;
                if let Err(e) = &result {
                    tracing::warn!("store host: {} failed: {}", request.name(), e);
                }
                // The client may have timed out and gone away
                let _ = reply.send(result);
            }
            tracing::debug!("store host {} stopped", id_for_task);
        });

        let client = RemoteStore {
            tx,
            host_id,
            timeout,
        };
        (client, handle)
    }
}

/// Client half of a `StoreHost`
#[derive(Clone)]
pub struct RemoteStore {
    tx: mpsc::Sender<Envelope>,
    host_id: String,
    timeout: Duration,
}

impl RemoteStore {
    async fn call(&self, request: StoreRequest) -> StoreResult<StoreReply> {
        let name = request.name();
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            request,
            reply: reply_tx,
        };

        let exchange = async {
            self.tx
                .send(envelope)
                .await
                .map_err(|_| StoreError::ChannelInvalidated("store host is gone".to_string()))?;
            reply_rx.await.map_err(|_| {
                StoreError::ChannelInvalidated("store host dropped the request".to_string())
            })?
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result.map_err(classify_host_error),
            Err(_) => Err(StoreError::Transient(format!(
                "{} timed out after {:?}",
                name, self.timeout
            ))),
        }
    }
}

/// Failures inside the host are the host's business; from the page they look
/// like a hiccup worth retrying. Channel loss stays fatal.
fn classify_host_error(e: StoreError) -> StoreError {
    match e {
        StoreError::ChannelInvalidated(_) | StoreError::Transient(_) => e,
        other => StoreError::Transient(other.to_string()),
    }
}

#[async_trait]
impl ConversationStore for RemoteStore {
    async fn create(&self, conversation: &Conversation) -> StoreResult<()> {
        self.call(StoreRequest::Create(conversation.clone()))
            .await?
            .into_done()
    }

    async fn update(&self, conversation: &Conversation) -> StoreResult<()> {
        self.call(StoreRequest::Update(conversation.clone()))
            .await?
            .into_done()
    }

    async fn get_by_id(&self, id: &ConversationId) -> StoreResult<Option<Conversation>> {
        self.call(StoreRequest::GetById(id.clone())).await?.into_one()
    }

    async fn get_by_link(&self, link: &str) -> StoreResult<Option<Conversation>> {
        self.call(StoreRequest::GetByLink(link.to_string()))
            .await?
            .into_one()
    }

    async fn get_by_external_id(
        &self,
        platform: &str,
        external_id: &str,
    ) -> StoreResult<Option<Conversation>> {
        self.call(StoreRequest::GetByExternalId {
            platform: platform.to_string(),
            external_id: external_id.to_string(),
        })
        .await?
        .into_one()
    }

    async fn delete(&self, id: &ConversationId) -> StoreResult<()> {
        self.call(StoreRequest::Delete(id.clone())).await?.into_done()
    }

    async fn list_all(&self) -> StoreResult<Vec<Conversation>> {
        self.call(StoreRequest::ListAll).await?.into_many()
    }
}

impl PrivilegedStore for RemoteStore {
    fn liveness_id(&self) -> Option<String> {
        if self.tx.is_closed() {
            None
        } else {
            Some(self.host_id.clone())
        }
    }
}
