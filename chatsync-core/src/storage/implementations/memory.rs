//! In-memory ConversationStore implementation
//!
//! No persistence. Used for tests and as the host-side store of short-lived
//! sessions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::StoreResult;
use crate::storage::ids::ConversationId;
use crate::storage::traits::ConversationStore;
use crate::storage::types::{sort_by_last_activity, Conversation};

#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    conversations: Mutex<HashMap<ConversationId, Conversation>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn conversations(&self) -> MutexGuard<'_, HashMap<ConversationId, Conversation>> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored conversations (for testing)
    pub fn len(&self) -> usize {
        self.conversations().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn newest<'a>(candidates: impl Iterator<Item = &'a Conversation>) -> Option<Conversation> {
        candidates.max_by_key(|c| c.updated_at).cloned()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create(&self, conversation: &Conversation) -> StoreResult<()> {
        self.conversations()
            .entry(conversation.conversation_id.clone())
            .or_insert_with(|| conversation.clone());
        Ok(())
    }

    async fn update(&self, conversation: &Conversation) -> StoreResult<()> {
        self.conversations()
            .insert(conversation.conversation_id.clone(), conversation.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &ConversationId) -> StoreResult<Option<Conversation>> {
        Ok(self.conversations().get(id).cloned())
    }

    async fn get_by_link(&self, link: &str) -> StoreResult<Option<Conversation>> {
        let conversations = self.conversations();
        Ok(Self::newest(conversations.values().filter(|c| c.link == link)))
    }

    async fn get_by_external_id(
        &self,
        platform: &str,
        external_id: &str,
    ) -> StoreResult<Option<Conversation>> {
        let conversations = self.conversations();
        Ok(Self::newest(conversations.values().filter(|c| {
            c.platform == platform && c.external_id.as_deref() == Some(external_id)
        })))
    }

    async fn delete(&self, id: &ConversationId) -> StoreResult<()> {
        self.conversations().remove(id);
        Ok(())
    }

    async fn list_all(&self) -> StoreResult<Vec<Conversation>> {
        let mut result: Vec<_> = self.conversations().values().cloned().collect();
        sort_by_last_activity(&mut result);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::Message;

    fn sample(link: &str, external_id: Option<&str>) -> Conversation {
        Conversation::new(
            "p",
            link,
            external_id.map(str::to_string),
            "Title",
            vec![Message::user(0, "hello")],
        )
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_id() {
        let store = MemoryConversationStore::new();
        let conv = sample("https://x/chat/1", None);
        store.create(&conv).await.unwrap();

        let mut changed = conv.clone();
        changed.title = "Other".to_string();
        store.create(&changed).await.unwrap();

        assert_eq!(store.len(), 1);
        let stored = store.get_by_id(&conv.conversation_id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Title");
    }

    #[tokio::test]
    async fn test_update_upserts() {
        let store = MemoryConversationStore::new();
        let mut conv = sample("https://x/chat/1", None);
        store.update(&conv).await.unwrap();
        conv.title = "Renamed".to_string();
        store.update(&conv).await.unwrap();

        let stored = store.get_by_id(&conv.conversation_id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Renamed");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_secondary_lookups() {
        let store = MemoryConversationStore::new();
        let a = sample("https://x/chat/1", Some("ext-1"));
        let b = sample("https://x/chat/2", None);
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();

        let by_link = store.get_by_link("https://x/chat/2").await.unwrap().unwrap();
        assert_eq!(by_link.conversation_id, b.conversation_id);

        let by_ext = store.get_by_external_id("p", "ext-1").await.unwrap().unwrap();
        assert_eq!(by_ext.conversation_id, a.conversation_id);

        assert!(store.get_by_external_id("other", "ext-1").await.unwrap().is_none());
        assert!(store.get_by_link("https://x/chat/3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_conversation() {
        let store = MemoryConversationStore::new();
        let conv = sample("https://x/chat/1", None);
        store.create(&conv).await.unwrap();
        assert_eq!(store.list_all().await.unwrap().len(), 1);

        store.delete(&conv.conversation_id).await.unwrap();
        assert!(store.list_all().await.unwrap().is_empty());
    }
}
