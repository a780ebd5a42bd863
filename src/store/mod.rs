//! Thread → topic correlation storage.
//!
//! A Slack thread is remembered by its channel and root timestamp; the value
//! is the remote assistant's topic id. Entries expire after a retention
//! window and an expired entry is indistinguishable from a missing one.

pub mod sqlite;

pub use sqlite::SqliteTopicStore;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Default retention for a thread's topic mapping (7 days).
pub const TOPIC_TTL_SECS: u64 = 604_800;

/// Identifies one chat thread: `(channel, thread root timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadKey {
    pub channel: String,
    pub thread_ts: String,
}

impl ThreadKey {
    pub fn new(channel: impl Into<String>, thread_ts: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            thread_ts: thread_ts.into(),
        }
    }

    /// Key under which the mapping is persisted.
    pub fn storage_key(&self) -> String {
        format!("thread:{}:{}", self.channel, self.thread_ts)
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// Durable key-value mapping with per-entry expiry.
///
/// Backends may be eventually consistent: a `put` is not guaranteed to be
/// visible to a concurrent `get` elsewhere, and there is no compare-and-set.
/// A second `put` for the same key overwrites the first.
#[async_trait]
pub trait TopicStore: Send + Sync {
    async fn get(&self, key: &ThreadKey) -> anyhow::Result<Option<String>>;

    async fn put(&self, key: &ThreadKey, topic_id: &str, ttl: Duration) -> anyhow::Result<()>;
}
