use super::{ThreadKey, TopicStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// SQLite-backed topic store. One row per thread, expiry stored as unix seconds.
pub struct SqliteTopicStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteTopicStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open topic DB: {}", path.display()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS thread_topics (
                key        TEXT PRIMARY KEY,
                topic_id   TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_thread_topics_expires_at ON thread_topics(expires_at);",
        )
        .context("Failed to initialize topic schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete expired rows. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM thread_topics WHERE expires_at <= ?1",
                params![now_unix_secs()],
            )
            .context("Failed to purge expired topics")
        })
        .await
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .context("Topic store task panicked")?
    }
}

#[async_trait]
impl TopicStore for SqliteTopicStore {
    async fn get(&self, key: &ThreadKey) -> Result<Option<String>> {
        let storage_key = key.storage_key();
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT topic_id FROM thread_topics WHERE key = ?1 AND expires_at > ?2",
                params![storage_key, now_unix_secs()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("Failed to read topic mapping")
        })
        .await
    }

    async fn put(&self, key: &ThreadKey, topic_id: &str, ttl: Duration) -> Result<()> {
        let storage_key = key.storage_key();
        let topic_id = topic_id.to_string();
        self.with_connection(move |conn| {
            let now = now_unix_secs();
            let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
            conn.execute(
                "INSERT INTO thread_topics (key, topic_id, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    topic_id = excluded.topic_id,
                    created_at = excluded.created_at,
                    expires_at = excluded.expires_at",
                params![storage_key, topic_id, now, now.saturating_add(ttl_secs)],
            )
            .context("Failed to write topic mapping")?;
            Ok(())
        })
        .await
    }
}

fn now_unix_secs() -> i64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    i64::try_from(secs).unwrap_or(i64::MAX)
}
