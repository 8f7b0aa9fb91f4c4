//! [`MemoryStore`] wrapper that injects store failures, for exercising the
//! retry and recovery paths in service tests.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use super::memory::MemoryStore;
use super::store::{CappedAdd, EphemeralStore, WindowState};
use crate::error::{AppError, AppResult};

#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    failing_gets: AtomicU32,
    failing_publishes: AtomicU32,
    capped_add_times_out: AtomicBool,
    closed_subscriptions: AtomicBool,
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn connection_reset() -> AppError {
    AppError::Redis(redis::RedisError::from(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset",
    )))
}

impl FaultyStore {
    /// The next `n` reads time out.
    pub fn fail_gets(&self, n: u32) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// The next `n` publishes fail with a connection error before sending.
    pub fn fail_publishes(&self, n: u32) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// `sadd_capped` applies the add and then reports a timeout.
    pub fn time_out_after_capped_add(&self) {
        self.capped_add_times_out.store(true, Ordering::SeqCst);
    }

    /// Subscriptions end as soon as they are opened.
    pub fn close_subscriptions(&self) {
        self.closed_subscriptions.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EphemeralStore for FaultyStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        self.inner.set_ex(key, value, ttl).await
    }

    async fn replace_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        self.inner.replace_ex(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        if take(&self.failing_gets) {
            return Err(AppError::StoreTimeout { operation: "get" });
        }
        self.inner.get(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn del(&self, key: &str) -> AppResult<bool> {
        self.inner.del(key).await
    }

    async fn keys(&self, pattern: &str) -> AppResult<Vec<String>> {
        self.inner.keys(pattern).await
    }

    async fn sadd(&self, key: &str, member: &str) -> AppResult<bool> {
        self.inner.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> AppResult<bool> {
        self.inner.srem(key, member).await
    }

    async fn scard(&self, key: &str) -> AppResult<u64> {
        self.inner.scard(key).await
    }

    async fn smembers(&self, key: &str) -> AppResult<Vec<String>> {
        self.inner.smembers(key).await
    }

    async fn sismember(&self, key: &str, member: &str) -> AppResult<bool> {
        self.inner.sismember(key, member).await
    }

    async fn sadd_capped(&self, key: &str, member: &str, max: u64) -> AppResult<CappedAdd> {
        let added = self.inner.sadd_capped(key, member, max).await?;
        if self.capped_add_times_out.load(Ordering::SeqCst) {
            return Err(AppError::StoreTimeout {
                operation: "sadd_capped",
            });
        }
        Ok(added)
    }

    async fn rate_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
        record: bool,
    ) -> AppResult<WindowState> {
        self.inner
            .rate_window(key, now_ms, window_ms, limit, record)
            .await
    }

    async fn publish(&self, channel: &str, message: &str) -> AppResult<u64> {
        if take(&self.failing_publishes) {
            return Err(connection_reset());
        }
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> AppResult<BoxStream<'static, String>> {
        if self.closed_subscriptions.load(Ordering::SeqCst) {
            return Ok(stream::empty().boxed());
        }
        self.inner.subscribe(channel).await
    }
}
