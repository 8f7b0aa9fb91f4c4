//! The shared keyed store: TTL keys, sets, pub/sub and two atomic scripts.
//!
//! Everything that must stay consistent across server processes lives behind
//! this trait. Implementations must make [`EphemeralStore::sadd_capped`] and
//! [`EphemeralStore::rate_window`] single indivisible steps.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::error::AppResult;

/// Result of [`EphemeralStore::sadd_capped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CappedAdd {
    Added { size: u64 },
    AlreadyPresent { size: u64 },
    Full { size: u64 },
}

/// Standing of a sliding request log after [`EphemeralStore::rate_window`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// `count < limit` held when the call was evaluated.
    pub allowed: bool,
    /// Entries inside the window after the call (including one just recorded).
    pub count: u64,
    /// Timestamp (ms) of the oldest entry still inside the window.
    pub oldest_ms: Option<i64>,
}

#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// SET with expiry.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;

    /// SET with expiry only if the key still exists. Returns `false` if it was gone.
    async fn replace_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool>;

    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Reset a key's expiry. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool>;

    /// Returns `true` if a key was removed.
    async fn del(&self, key: &str) -> AppResult<bool>;

    /// Keys matching a glob pattern (`*` wildcard).
    async fn keys(&self, pattern: &str) -> AppResult<Vec<String>>;

    /// Returns `true` if the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> AppResult<bool>;

    /// Returns `true` if the member was present.
    async fn srem(&self, key: &str, member: &str) -> AppResult<bool>;

    async fn scard(&self, key: &str) -> AppResult<u64>;

    async fn smembers(&self, key: &str) -> AppResult<Vec<String>>;

    async fn sismember(&self, key: &str, member: &str) -> AppResult<bool>;

    /// Atomically add `member` unless the set already holds `max` members.
    async fn sadd_capped(&self, key: &str, member: &str, max: u64) -> AppResult<CappedAdd>;

    /// Atomically drop entries at or before `now_ms - window_ms`, count the rest,
    /// and (when `record` is set and `count < limit`) append `now_ms`.
    async fn rate_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
        record: bool,
    ) -> AppResult<WindowState>;

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, message: &str) -> AppResult<u64>;

    /// Subscribe to a channel. The subscription is live when this returns and is
    /// released when the stream is dropped.
    async fn subscribe(&self, channel: &str) -> AppResult<BoxStream<'static, String>>;
}
