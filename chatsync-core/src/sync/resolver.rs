//! Which stored conversation owns a page
//!
//! Lookup order: the platform's external id first (authoritative), then the
//! query-stripped URL. A URL hit that belongs to a different external id is
//! rejected, since platforms reuse URLs for "new chat" placeholders and
//! accepting it would pour one conversation into another.

use std::sync::Arc;

use crate::error::StoreResult;
use crate::storage::ids::ConversationId;
use crate::storage::traits::ConversationStore;
use crate::sync::adapter::PlatformAdapter;
use crate::sync::keys::{strip_query, PlaceholderIds, UrlKey};

/// Everything identity resolution needs to know about a page instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageIdentity {
    pub platform: String,
    pub url: String,
    pub external_id: Option<String>,
}

impl PageIdentity {
    pub fn new(platform: impl Into<String>, url: impl Into<String>, external_id: Option<String>) -> Self {
        Self {
            platform: platform.into(),
            url: url.into(),
            external_id,
        }
    }

    /// Read platform and external id for `url` through the adapter
    pub fn from_adapter(adapter: &dyn PlatformAdapter, url: &str) -> Self {
        let info = adapter.extract_conversation_info(url);
        let external_id = if info.is_new_conversation {
            None
        } else {
            info.conversation_id
        };
        Self::new(adapter.platform(), url, external_id)
    }

    pub fn link(&self) -> String {
        strip_query(&self.url)
    }

    pub fn url_key(&self) -> UrlKey {
        UrlKey::new(&self.platform, &self.url)
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn ConversationStore>,
    placeholders: PlaceholderIds,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn ConversationStore>, placeholders: PlaceholderIds) -> Self {
        Self {
            store,
            placeholders,
        }
    }

    /// The page's external id, unless missing or a placeholder
    pub fn external_id<'a>(&self, page: &'a PageIdentity) -> Option<&'a str> {
        self.placeholders.usable(page.external_id.as_deref())
    }

    /// Stored conversation for `page`, if any. Reads only, apart from a
    /// background backfill of a missing external id.
    pub async fn resolve(&self, page: &PageIdentity) -> StoreResult<Option<ConversationId>> {
        if let Some(external_id) = self.external_id(page) {
            if let Some(found) = self
                .store
                .get_by_external_id(&page.platform, external_id)
                .await?
            {
                tracing::debug!("{} resolved by external id {}", found.conversation_id, external_id);
                return Ok(Some(found.conversation_id));
            }
        }

        self.resolve_by_link(page).await
    }

    /// URL step on its own. Also serves as the double-check right before a
    /// conversation is created.
    pub async fn resolve_by_link(&self, page: &PageIdentity) -> StoreResult<Option<ConversationId>> {
        let link = page.link();
        let Some(found) = self.store.get_by_link(&link).await? else {
            return Ok(None);
        };

        let external_id = self.external_id(page);
        if let Some(stored) = found.external_id.as_deref() {
            if Some(stored) != external_id {
                tracing::info!(
                    "ignoring {} at {}: it belongs to external id {}, page has {:?}",
                    found.conversation_id,
                    link,
                    stored,
                    external_id
                );
                return Ok(None);
            }
        } else if let Some(external_id) = external_id {
            self.schedule_backfill(found.conversation_id.clone(), external_id.to_string());
        }

        tracing::debug!("{} resolved by link {}", found.conversation_id, link);
        Ok(Some(found.conversation_id))
    }

    /// Record the external id on a conversation that was stored without one.
    /// Best effort; failures are only logged.
    fn schedule_backfill(&self, id: ConversationId, external_id: String) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match backfill_external_id(store.as_ref(), &id, &external_id).await {
                Ok(true) => tracing::info!("backfilled external id {} onto {}", external_id, id),
                Ok(false) => {}
                Err(e) => tracing::warn!("external id backfill for {} failed: {}", id, e),
            }
        });
    }
}

async fn backfill_external_id(
    store: &dyn ConversationStore,
    id: &ConversationId,
    external_id: &str,
) -> StoreResult<bool> {
    let Some(mut conversation) = store.get_by_id(id).await? else {
        return Ok(false);
    };
    if conversation.external_id.is_some() {
        return Ok(false);
    }
    conversation.external_id = Some(external_id.to_string());
    store.update(&conversation).await?;
    Ok(true)
}
