//! SQLite storage backend
//!
//! `SqliteStore` is the local fallback store. The connection is opened lazily
//! on first use and shared by every call afterwards. Messages are stored as a
//! JSON column since they are always read and written as a whole.
//!
//! Schema history (tracked in `PRAGMA user_version`):
//! - 1: conversations table with link/platform/timestamp indexes
//! - 2: `external_id` column and index

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::sync::OnceCell;

use crate::error::{StoreError, StoreResult};
use crate::storage::ids::ConversationId;
use crate::storage::traits::ConversationStore;
use crate::storage::types::{sort_by_last_activity, Conversation, Message};

pub const SCHEMA_VERSION: i64 = 2;

pub(crate) const SCHEMA_V1: &str = r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        link TEXT NOT NULL,
        title TEXT NOT NULL,
        platform TEXT NOT NULL,
        messages TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_conversations_link ON conversations(link);
    CREATE INDEX IF NOT EXISTS idx_conversations_platform ON conversations(platform);
    CREATE INDEX IF NOT EXISTS idx_conversations_created ON conversations(created_at);
    CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at);
"#;

const SCHEMA_V2_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_conversations_external ON conversations(platform, external_id)";

const SELECT_COLUMNS: &str =
    "SELECT id, external_id, link, title, platform, messages, created_at, updated_at FROM conversations";

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// Local embedded conversation store
pub struct SqliteStore {
    location: Location,
    conn: OnceCell<Arc<Mutex<Connection>>>,
    /// Whether the opened schema has the `external_id` column, checked once
    external_ids: OnceLock<bool>,
}

impl SqliteStore {
    /// Store backed by the database file at `path`. Nothing is opened until
    /// the first call.
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            location: Location::File(path.as_ref().to_path_buf()),
            conn: OnceCell::new(),
            external_ids: OnceLock::new(),
        }
    }

    /// Create an in-memory SQLite database (useful for testing)
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            conn: OnceCell::new(),
            external_ids: OnceLock::new(),
        }
    }

    /// The shared connection, opened and migrated on first use
    async fn conn(&self) -> StoreResult<Arc<Mutex<Connection>>> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let conn = match &self.location {
                    Location::File(path) => {
                        if let Some(parent) = path.parent() {
                            std::fs::create_dir_all(parent).map_err(|e| {
                                StoreError::Local(format!("creating {}: {}", parent.display(), e))
                            })?;
                        }
                        Connection::open(path)?
                    }
                    Location::Memory => Connection::open_in_memory()?,
                };
                migrate(&conn)?;
                let external_ids = has_column(&conn, "conversations", "external_id")?;
                if !external_ids {
                    tracing::warn!("local store has no external_id column; lookups by it find nothing");
                }
                let _ = self.external_ids.set(external_ids);
                tracing::debug!("opened local store ({:?})", self.location);
                Ok::<_, StoreError>(Arc::new(Mutex::new(conn)))
            })
            .await?;
        Ok(Arc::clone(conn))
    }

    fn has_external_ids(&self) -> bool {
        self.external_ids.get().copied().unwrap_or(false)
    }
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bring an on-disk schema up to `SCHEMA_VERSION` without touching existing rows
pub(crate) fn migrate(conn: &Connection) -> StoreResult<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch("BEGIN")?;
    let result = (|| -> StoreResult<()> {
        conn.execute_batch(SCHEMA_V1)?;
        if !has_column(conn, "conversations", "external_id")? {
            conn.execute_batch("ALTER TABLE conversations ADD COLUMN external_id TEXT")?;
        }
        conn.execute_batch(SCHEMA_V2_INDEX)?;
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            if version > 0 {
                tracing::info!("upgraded local store schema from v{} to v{}", version, SCHEMA_VERSION);
            }
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn has_column(conn: &Connection, table: &str, column: &str) -> StoreResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<(Conversation, String)> {
    let messages: String = row.get(5)?;
    let conversation = Conversation {
        conversation_id: row.get(0)?,
        external_id: row.get(1)?,
        link: row.get(2)?,
        title: row.get(3)?,
        platform: row.get(4)?,
        messages: Vec::new(),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    };
    Ok((conversation, messages))
}

fn decode((mut conversation, messages): (Conversation, String)) -> StoreResult<Conversation> {
    conversation.messages = serde_json::from_str::<Vec<Message>>(&messages)?;
    Ok(conversation)
}

fn query_one(
    conn: &Connection,
    clause: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Option<Conversation>> {
    let sql = format!("{SELECT_COLUMNS} {clause}");
    let row = conn.query_row(&sql, params, read_row).optional()?;
    row.map(decode).transpose()
}

// ============================================================================
// ConversationStore Implementation
// ============================================================================

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create(&self, conversation: &Conversation) -> StoreResult<()> {
        let messages = serde_json::to_string(&conversation.messages)?;
        let conn = self.conn().await?;
        let conn = lock(&conn);
        conn.execute(
            "INSERT INTO conversations (id, external_id, link, title, platform, messages, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO NOTHING",
            params![
                conversation.conversation_id,
                conversation.external_id,
                conversation.link,
                conversation.title,
                conversation.platform,
                messages,
                conversation.created_at,
                conversation.updated_at
            ],
        )?;
        Ok(())
    }

    async fn update(&self, conversation: &Conversation) -> StoreResult<()> {
        let messages = serde_json::to_string(&conversation.messages)?;
        let conn = self.conn().await?;
        let conn = lock(&conn);
        conn.execute(
            "INSERT INTO conversations (id, external_id, link, title, platform, messages, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                external_id = excluded.external_id,
                link = excluded.link,
                title = excluded.title,
                platform = excluded.platform,
                messages = excluded.messages,
                updated_at = excluded.updated_at",
            params![
                conversation.conversation_id,
                conversation.external_id,
                conversation.link,
                conversation.title,
                conversation.platform,
                messages,
                conversation.created_at,
                conversation.updated_at
            ],
        )?;
        Ok(())
    }

    async fn get_by_id(&self, id: &ConversationId) -> StoreResult<Option<Conversation>> {
        let conn = self.conn().await?;
        let conn = lock(&conn);
        query_one(&conn, "WHERE id = ?1", params![id])
    }

    async fn get_by_link(&self, link: &str) -> StoreResult<Option<Conversation>> {
        let conn = self.conn().await?;
        let conn = lock(&conn);
        query_one(
            &conn,
            "WHERE link = ?1 ORDER BY updated_at DESC LIMIT 1",
            params![link],
        )
    }

    async fn get_by_external_id(
        &self,
        platform: &str,
        external_id: &str,
    ) -> StoreResult<Option<Conversation>> {
        let conn = self.conn().await?;
        // A schema without the column simply has no matches
        if !self.has_external_ids() {
            return Ok(None);
        }
        let conn = lock(&conn);
        query_one(
            &conn,
            "WHERE platform = ?1 AND external_id = ?2 ORDER BY updated_at DESC LIMIT 1",
            params![platform, external_id],
        )
    }

    async fn delete(&self, id: &ConversationId) -> StoreResult<()> {
        let conn = self.conn().await?;
        let conn = lock(&conn);
        conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn list_all(&self) -> StoreResult<Vec<Conversation>> {
        let conn = self.conn().await?;
        let rows = {
            let conn = lock(&conn);
            let mut stmt = conn.prepare(SELECT_COLUMNS)?;
            let rows = stmt
                .query_map([], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut conversations = rows
            .into_iter()
            .map(decode)
            .collect::<StoreResult<Vec<_>>>()?;
        sort_by_last_activity(&mut conversations);
        Ok(conversations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(link: &str, external_id: Option<&str>) -> Conversation {
        Conversation::new(
            "p",
            link,
            external_id.map(str::to_string),
            "Title",
            vec![
                Message::user(0, "hello"),
                Message::ai(1, "hi there").with_thinking("greet back"),
            ],
        )
    }

    fn temp_db(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "chatsync-{}-{}-{}.db",
            name,
            std::process::id(),
            ConversationId::new()
        ))
    }

    #[tokio::test]
    async fn test_round_trip_preserves_messages() {
        let store = SqliteStore::in_memory();
        let conv = sample("https://x/chat/1", Some("ext-1"));
        store.create(&conv).await.unwrap();

        let stored = store.get_by_id(&conv.conversation_id).await.unwrap().unwrap();
        assert_eq!(stored, conv);
    }

    #[tokio::test]
    async fn test_update_replaces_record() {
        let store = SqliteStore::in_memory();
        let mut conv = sample("https://x/chat/1", None);
        store.create(&conv).await.unwrap();

        conv.replace_messages(vec![Message::user(0, "edited")]);
        conv.external_id = Some("ext-9".to_string());
        store.update(&conv).await.unwrap();

        let stored = store.get_by_external_id("p", "ext-9").await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.messages[0].content, "edited");
        assert_eq!(stored.created_at, conv.created_at);
    }

    #[tokio::test]
    async fn test_create_does_not_overwrite() {
        let store = SqliteStore::in_memory();
        let conv = sample("https://x/chat/1", None);
        store.create(&conv).await.unwrap();

        let mut again = conv.clone();
        again.title = "Changed".to_string();
        store.create(&again).await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "Title");
    }

    #[tokio::test]
    async fn test_get_by_link_and_delete() {
        let store = SqliteStore::in_memory();
        let conv = sample("https://x/chat/1", None);
        store.create(&conv).await.unwrap();

        let found = store.get_by_link("https://x/chat/1").await.unwrap().unwrap();
        assert_eq!(found.conversation_id, conv.conversation_id);

        store.delete(&conv.conversation_id).await.unwrap();
        assert!(store.get_by_link("https://x/chat/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_all_orders_by_last_activity() {
        let store = SqliteStore::in_memory();

        let mut touched = sample("https://x/chat/1", None);
        touched.messages = vec![Message::user(0, "old").at(1_000)];
        touched.updated_at = 50_000;

        let mut chatty = sample("https://x/chat/2", None);
        chatty.messages = vec![Message::user(0, "recent").at(40_000)];
        chatty.updated_at = 2_000;

        store.create(&touched).await.unwrap();
        store.create(&chatty).await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all[0].conversation_id, chatty.conversation_id);
        assert_eq!(all[1].conversation_id, touched.conversation_id);
    }

    #[tokio::test]
    async fn test_external_lookup_without_column_is_not_found() {
        // A v1 table that already claims the current version skips migration
        let path = temp_db("no-external");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(SCHEMA_V1).unwrap();
            conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
                .unwrap();
        }

        let store = SqliteStore::open(&path);
        assert!(store.get_by_external_id("p", "ext-1").await.unwrap().is_none());
        assert!(!store.has_external_ids());
        assert!(store.get_by_external_id("p", "ext-2").await.unwrap().is_none());

        drop(store);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_external_id_column_checked_once_on_open() {
        let store = SqliteStore::in_memory();
        assert_eq!(store.external_ids.get(), None);

        store.list_all().await.unwrap();
        assert_eq!(store.external_ids.get(), Some(&true));
    }

    #[tokio::test]
    async fn test_v1_database_is_upgraded_without_data_loss() {
        let path = temp_db("upgrade");
        let legacy = sample("https://x/chat/legacy", None);
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(SCHEMA_V1).unwrap();
            conn.execute_batch("PRAGMA user_version = 1").unwrap();
            conn.execute(
                "INSERT INTO conversations (id, link, title, platform, messages, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    legacy.conversation_id,
                    legacy.link,
                    legacy.title,
                    legacy.platform,
                    serde_json::to_string(&legacy.messages).unwrap(),
                    legacy.created_at,
                    legacy.updated_at
                ],
            )
            .unwrap();
        }

        let store = SqliteStore::open(&path);
        assert!(store.get_by_external_id("p", "ext-1").await.unwrap().is_none());

        let found = store.get_by_link(&legacy.link).await.unwrap().unwrap();
        assert_eq!(found, legacy);

        let mut backfilled = found.clone();
        backfilled.external_id = Some("ext-1".to_string());
        store.update(&backfilled).await.unwrap();
        let by_ext = store.get_by_external_id("p", "ext-1").await.unwrap().unwrap();
        assert_eq!(by_ext.conversation_id, legacy.conversation_id);

        drop(store);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_connection_is_shared() {
        let store = SqliteStore::in_memory();
        let first = store.conn().await.unwrap();
        let second = store.conn().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
