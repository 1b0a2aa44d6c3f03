use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;

use super::{ChatUpdate, StoreError, SubscriptionStore, UserUpdate, introduced_tokens};
use crate::model::{
    ChatData, ChatId, Hook, OAuthCorrelation, OAuthProviderRecord, RequestToken, UserData, UserId,
};
use crate::query::Query;

const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    doc TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS chats (
    id INTEGER PRIMARY KEY,
    doc TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS hook_tokens (
    token TEXT PRIMARY KEY,
    owner_table TEXT NOT NULL,
    owner_id INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS users_cache (
    key TEXT PRIMARY KEY,
    doc TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS oauth_providers (
    id TEXT PRIMARY KEY,
    doc TEXT NOT NULL
);
"#;

const DOC_TABLES: [&str; 2] = ["users", "chats"];

/// Documents are stored as JSON text, one row per user or chat. Hook tokens
/// are indexed in `hook_tokens`, whose primary key keeps them globally unique.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<StdMutex<Connection>>,
}

fn backend(err: impl Into<anyhow::Error>) -> StoreError {
    StoreError::Backend(err.into())
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(CREATE_TABLES_SQL)?;
        backfill_token_index(&mut conn)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, func: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| backend(anyhow::anyhow!("sqlite connection lock poisoned")))?;
            func(&mut guard)
        })
        .await
        .map_err(backend)?
    }

    async fn find_docs<T>(&self, table: &'static str, query: &Query) -> Result<Vec<T>, StoreError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let query = query.clone();
        self.with_conn(move |conn| {
            let raw_docs: Vec<String> = if let Some(token) = query.as_hook_token() {
                owner_doc(conn, table, token)?.into_iter().collect()
            } else if let Some(id) = query.as_id() {
                load_doc_raw(conn, table, id)?.into_iter().collect()
            } else {
                load_docs(conn, table)?
            };
            let mut out = Vec::new();
            for raw in raw_docs {
                let value: serde_json::Value = serde_json::from_str(&raw)?;
                if query.matches(&value) {
                    out.push(serde_json::from_value(value)?);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn update_doc<T, F>(&self, table: &'static str, id: i64, update: F) -> Result<T, StoreError>
    where
        T: HookOwner + Clone + Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(&mut T) + Send + 'static,
    {
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            let before: T = match load_doc_raw(&tx, table, id)? {
                Some(raw) => serde_json::from_str(&raw)?,
                None => T::empty(id),
            };
            let mut after = before.clone();
            update(&mut after);
            after.set_id(id);

            let added = introduced_tokens(before.hooks(), after.hooks())?;
            let kept: HashSet<&str> = after.hooks().iter().map(|h| h.token.as_str()).collect();
            for gone in before.hooks().iter().filter(|h| !kept.contains(h.token.as_str())) {
                tx.execute(
                    "DELETE FROM hook_tokens WHERE token = ?1 AND owner_table = ?2 AND owner_id = ?3",
                    params![gone.token, table, id],
                )
                .map_err(backend)?;
            }
            for token in added {
                index_token(&tx, &token, table, id)?;
            }
            upsert_doc(&tx, table, id, &after)?;
            tx.commit().map_err(backend)?;
            Ok(after)
        })
        .await
    }
}

/// Documents carrying hooks, stored in one of the document tables.
trait HookOwner {
    fn empty(id: i64) -> Self;
    fn set_id(&mut self, id: i64);
    fn hooks(&self) -> &[Hook];
    fn hooks_mut(&mut self) -> &mut Vec<Hook>;
}

impl HookOwner for UserData {
    fn empty(id: i64) -> Self {
        UserData::new(id)
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn hooks(&self) -> &[Hook] {
        &self.hooks
    }
    fn hooks_mut(&mut self) -> &mut Vec<Hook> {
        &mut self.hooks
    }
}

impl HookOwner for ChatData {
    fn empty(id: i64) -> Self {
        ChatData::new(id)
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn hooks(&self) -> &[Hook] {
        &self.hooks
    }
    fn hooks_mut(&mut self) -> &mut Vec<Hook> {
        &mut self.hooks
    }
}

fn index_token(conn: &Connection, token: &str, table: &str, id: i64) -> Result<(), StoreError> {
    match conn.execute(
        "INSERT INTO hook_tokens (token, owner_table, owner_id) VALUES (?1, ?2, ?3)",
        params![token, table, id],
    ) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
            Err(StoreError::DuplicateToken(token.to_string()))
        }
        Err(err) => Err(backend(err)),
    }
}

/// Indexes documents written before the token table existed.
fn backfill_token_index(conn: &mut Connection) -> anyhow::Result<()> {
    let indexed: i64 = conn.query_row("SELECT COUNT(*) FROM hook_tokens", [], |row| row.get(0))?;
    if indexed > 0 {
        return Ok(());
    }
    let tx = conn.transaction()?;
    for table in DOC_TABLES {
        for raw in load_docs(&tx, table)? {
            let doc: serde_json::Value = serde_json::from_str(&raw)?;
            let id = doc.get("id").and_then(|v| v.as_i64()).unwrap_or_default();
            let hooks = doc.get("hooks").and_then(|v| v.as_array()).cloned().unwrap_or_default();
            for hook in hooks {
                if let Some(token) = hook.get("token").and_then(|v| v.as_str()) {
                    tx.execute(
                        "INSERT OR IGNORE INTO hook_tokens (token, owner_table, owner_id)
                         VALUES (?1, ?2, ?3)",
                        params![token, table, id],
                    )?;
                }
            }
        }
    }
    tx.commit()?;
    Ok(())
}

fn load_docs(conn: &Connection, table: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn
        .prepare(&format!("SELECT doc FROM {table} ORDER BY id"))
        .map_err(backend)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(backend)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(backend)
}

fn load_doc_raw(conn: &Connection, table: &str, id: i64) -> Result<Option<String>, StoreError> {
    conn.query_row(
        &format!("SELECT doc FROM {table} WHERE id = ?1"),
        params![id],
        |row| row.get(0),
    )
    .optional()
    .map_err(backend)
}

/// Document in `table` owning `token`, resolved through the token index.
fn owner_doc(conn: &Connection, table: &str, token: &str) -> Result<Option<String>, StoreError> {
    conn.query_row(
        &format!(
            "SELECT d.doc FROM hook_tokens t JOIN {table} d ON d.id = t.owner_id
             WHERE t.token = ?1 AND t.owner_table = ?2"
        ),
        params![token, table],
        |row| row.get(0),
    )
    .optional()
    .map_err(backend)
}

fn upsert_doc<T: Serialize>(
    tx: &Transaction<'_>,
    table: &str,
    id: i64,
    doc: &T,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(doc)?;
    tx.execute(
        &format!(
            "INSERT INTO {table} (id, doc) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET doc = excluded.doc"
        ),
        params![id, raw],
    )
    .map_err(backend)?;
    Ok(())
}

fn remove_from<T>(tx: &Transaction<'_>, table: &str, id: i64, token: &str) -> Result<bool, StoreError>
where
    T: HookOwner + Serialize + DeserializeOwned,
{
    let Some(raw) = load_doc_raw(tx, table, id)? else {
        return Ok(false);
    };
    let mut doc: T = serde_json::from_str(&raw)?;
    doc.hooks_mut().retain(|h| h.token != token);
    upsert_doc(tx, table, id, &doc)?;
    Ok(true)
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn find_user(&self, query: &Query) -> Result<Option<UserData>, StoreError> {
        Ok(self.find_users(query).await?.into_iter().next())
    }

    async fn find_users(&self, query: &Query) -> Result<Vec<UserData>, StoreError> {
        self.find_docs("users", query).await
    }

    async fn find_chat(&self, query: &Query) -> Result<Option<ChatData>, StoreError> {
        Ok(self.find_chats(query).await?.into_iter().next())
    }

    async fn find_chats(&self, query: &Query) -> Result<Vec<ChatData>, StoreError> {
        self.find_docs("chats", query).await
    }

    async fn update_user(&self, id: UserId, update: UserUpdate) -> Result<UserData, StoreError> {
        self.update_doc("users", id, update).await
    }

    async fn update_chat(&self, id: ChatId, update: ChatUpdate) -> Result<ChatData, StoreError> {
        self.update_doc("chats", id, update).await
    }

    async fn remove_hook(&self, token: &str) -> Result<bool, StoreError> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            let owner: Option<(String, i64)> = tx
                .query_row(
                    "SELECT owner_table, owner_id FROM hook_tokens WHERE token = ?1",
                    params![token],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(backend)?;
            let removed = match owner {
                Some((table, id)) if table == "users" => remove_from::<UserData>(&tx, "users", id, &token)?,
                Some((_, id)) => remove_from::<ChatData>(&tx, "chats", id, &token)?,
                None => return Ok(false),
            };
            tx.execute("DELETE FROM hook_tokens WHERE token = ?1", params![token])
                .map_err(backend)?;
            tx.commit().map_err(backend)?;
            Ok(removed)
        })
        .await
    }

    async fn put_correlation(&self, record: &OAuthCorrelation) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record)?;
        let key = record.key.clone();
        let created_at = record.created_at.unix_timestamp();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users_cache (key, doc, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET doc = excluded.doc, created_at = excluded.created_at",
                params![key, raw, created_at],
            )
            .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn get_correlation(
        &self,
        ephemeral_id: &str,
    ) -> Result<Option<OAuthCorrelation>, StoreError> {
        let key = OAuthCorrelation::key_for(ephemeral_id);
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT doc FROM users_cache WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set_request_token(
        &self,
        ephemeral_id: &str,
        token: &RequestToken,
    ) -> Result<bool, StoreError> {
        let Some(mut record) = self.get_correlation(ephemeral_id).await? else {
            return Ok(false);
        };
        record.val.request_token = Some(token.clone());
        self.put_correlation(&record).await?;
        Ok(true)
    }

    async fn purge_correlations(&self, cutoff: OffsetDateTime) -> Result<usize, StoreError> {
        let cutoff = cutoff.unix_timestamp();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM users_cache WHERE created_at < ?1",
                params![cutoff],
            )
            .map_err(backend)
        })
        .await
    }

    async fn put_oauth_provider(&self, provider: &OAuthProviderRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_string(provider)?;
        let id = provider.internal_id();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO oauth_providers (id, doc) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET doc = excluded.doc",
                params![id, raw],
            )
            .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn get_oauth_provider(
        &self,
        internal_id: &str,
    ) -> Result<Option<OAuthProviderRecord>, StoreError> {
        let id = internal_id.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT doc FROM oauth_providers WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hooks.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .add_user_hook(42, Hook::with_token("uPersist").with_service("trello"))
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let user = store
            .find_user(&Query::hook_token("uPersist"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.id, 42);
        assert_eq!(user.hooks[0].services, vec!["trello"]);
    }

    #[tokio::test]
    async fn duplicate_token_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add_user_hook(1, Hook::with_token("uDup")).await.unwrap();
        let err = store
            .add_chat_hook(-5, Hook::with_token("uDup"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateToken(t) if t == "uDup"));
        assert!(store.get_chat(-5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn correlations_and_providers_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = OAuthCorrelation::with_id("e1", 9, "gitlab", "https://git.example");
        store.put_correlation(&record).await.unwrap();
        let token = RequestToken {
            token: "t".into(),
            secret: "s".into(),
        };
        assert!(store.set_request_token("e1", &token).await.unwrap());
        let loaded = store.get_correlation("e1").await.unwrap().unwrap();
        assert_eq!(loaded.user_id, 9);
        assert_eq!(loaded.val.request_token, Some(token));

        let provider = OAuthProviderRecord::new("gitlab", "https://git.example")
            .with_credentials("id", "secret");
        store.put_oauth_provider(&provider).await.unwrap();
        assert_eq!(
            store
                .get_oauth_provider(&provider.internal_id())
                .await
                .unwrap(),
            Some(provider)
        );

        let purged = store
            .purge_correlations(OffsetDateTime::now_utc() + time::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn remove_hook_updates_owner() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .add_chat_hook(-7, Hook::with_token("cGone"))
            .await
            .unwrap();
        assert!(store.remove_hook("cGone").await.unwrap());
        assert!(store.get_chat(-7).await.unwrap().unwrap().hooks.is_empty());
        assert!(!store.remove_hook("cGone").await.unwrap());
    }

    #[tokio::test]
    async fn token_index_follows_hook_edits() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .add_user_hook(1, Hook::with_token("uMoving").with_service("a"))
            .await
            .unwrap();
        assert!(
            store
                .find_chat(&Query::hook_token("uMoving"))
                .await
                .unwrap()
                .is_none()
        );

        store
            .update_user(1, Box::new(|user| user.hooks.clear()))
            .await
            .unwrap();
        assert!(
            store
                .find_user(&Query::hook_token("uMoving"))
                .await
                .unwrap()
                .is_none()
        );

        store
            .add_chat_hook(-3, Hook::with_token("uMoving"))
            .await
            .unwrap();
        let chat = store
            .find_chat(&Query::hook_token("uMoving"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chat.id, -3);
    }

    #[tokio::test]
    async fn existing_documents_are_indexed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, doc TEXT NOT NULL);
                 CREATE TABLE chats (id INTEGER PRIMARY KEY, doc TEXT NOT NULL);",
            )
            .unwrap();
            conn.execute(
                "INSERT INTO chats (id, doc) VALUES (-9, ?1)",
                params![r#"{"id":-9,"hooks":[{"token":"cOld","services":["feed"],"chats":[]}]}"#],
            )
            .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let chat = store
            .find_chat(&Query::hook_token("cOld"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chat.id, -9);
        let err = store
            .add_user_hook(5, Hook::with_token("cOld"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateToken(_)));
    }
}
