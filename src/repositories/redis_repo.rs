//! Redis-backed store: TTL keys and sets for presence/membership, Lua scripts
//! for the atomic operations, pub/sub for event fan-out.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::store::{CappedAdd, EphemeralStore, WindowState};
use crate::error::{AppError, AppResult};

const KEY_PREFIX: &str = "mapmeet:";
const CHANNEL_PREFIX: &str = "mapmeet:channel:";

/// KEYS[1] = set, ARGV[1] = member, ARGV[2] = max.
/// Returns {status, size}: 0 added, 1 already present, 2 full.
const CAPPED_ADD_LUA: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
  return {1, redis.call('SCARD', KEYS[1])}
end
local size = redis.call('SCARD', KEYS[1])
if size >= tonumber(ARGV[2]) then
  return {2, size}
end
redis.call('SADD', KEYS[1], ARGV[1])
return {0, size + 1}
"#;

/// KEYS[1] = sorted set, ARGV = now_ms, window_ms, limit, record (0/1), member.
/// Returns {allowed, count, oldest_ms or -1}.
const RATE_WINDOW_LUA: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
local allowed = 0
if count < limit then
  allowed = 1
  if ARGV[4] == '1' then
    redis.call('ZADD', KEYS[1], now, ARGV[5])
    redis.call('PEXPIRE', KEYS[1], window)
    count = count + 1
  end
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local oldest_ms = -1
if oldest[2] then
  oldest_ms = tonumber(oldest[2])
end
return {allowed, count, oldest_ms}
"#;

fn key(k: &str) -> String {
    format!("{}{}", KEY_PREFIX, k)
}

fn channel_key(channel: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, channel)
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Redis-backed [`EphemeralStore`]. Cheap to clone.
#[derive(Clone)]
pub struct RedisStore {
    client: Arc<redis::Client>,
    conn: ConnectionManager,
    op_timeout: Duration,
    capped_add: Arc<Script>,
    rate_window: Arc<Script>,
}

impl RedisStore {
    /// Connect to Redis. Every later command is bounded by `op_timeout`.
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> AppResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = match tokio::time::timeout(op_timeout, ConnectionManager::new(client.clone())).await {
            Ok(conn) => conn?,
            Err(_) => return Err(AppError::StoreTimeout { operation: "connect" }),
        };
        info!("connected to redis");
        Ok(Self {
            client: Arc::new(client),
            conn,
            op_timeout,
            capped_add: Arc::new(Script::new(CAPPED_ADD_LUA)),
            rate_window: Arc::new(Script::new(RATE_WINDOW_LUA)),
        })
    }

    async fn bounded<T, F>(&self, operation: &'static str, key: &str, fut: F) -> AppResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(operation, key = %key, error = %e, "redis command failed");
                Err(e.into())
            }
            Err(_) => {
                error!(operation, key = %key, "redis command timed out");
                Err(AppError::StoreTimeout { operation })
            }
        }
    }
}

#[async_trait]
impl EphemeralStore for RedisStore {
    async fn set_ex(&self, k: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let full = key(k);
        self.bounded("set_ex", k, async move {
            redis::cmd("SET")
                .arg(&full)
                .arg(value)
                .arg("PX")
                .arg(ttl_ms(ttl))
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn replace_ex(&self, k: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let full = key(k);
        let reply: Option<String> = self
            .bounded("replace_ex", k, async move {
                redis::cmd("SET")
                    .arg(&full)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl_ms(ttl))
                    .arg("XX")
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, k: &str) -> AppResult<Option<String>> {
        let mut conn = self.conn.clone();
        let full = key(k);
        self.bounded("get", k, async move { conn.get(&full).await }).await
    }

    async fn expire(&self, k: &str, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let full = key(k);
        let updated: i64 = self
            .bounded("expire", k, async move {
                redis::cmd("PEXPIRE")
                    .arg(&full)
                    .arg(ttl_ms(ttl))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(updated == 1)
    }

    async fn del(&self, k: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let full = key(k);
        let removed: i64 = self.bounded("del", k, async move { conn.del(&full).await }).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, pattern: &str) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let full = key(pattern);
        let found: Vec<String> = self
            .bounded("scan", pattern, async move {
                let mut iter: redis::AsyncIter<String> = conn.scan_match(&full).await?;
                let mut found = Vec::new();
                while let Some(k) = iter.next_item().await {
                    found.push(k);
                }
                Ok::<_, redis::RedisError>(found)
            })
            .await?;
        let mut keys: Vec<String> = found
            .into_iter()
            .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(str::to_string))
            .collect();
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn sadd(&self, k: &str, member: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let full = key(k);
        let added: i64 = self
            .bounded("sadd", k, async move { conn.sadd(&full, member).await })
            .await?;
        Ok(added == 1)
    }

    async fn srem(&self, k: &str, member: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let full = key(k);
        let removed: i64 = self
            .bounded("srem", k, async move { conn.srem(&full, member).await })
            .await?;
        Ok(removed == 1)
    }

    async fn scard(&self, k: &str) -> AppResult<u64> {
        let mut conn = self.conn.clone();
        let full = key(k);
        self.bounded("scard", k, async move { conn.scard(&full).await }).await
    }

    async fn smembers(&self, k: &str) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let full = key(k);
        self.bounded("smembers", k, async move { conn.smembers(&full).await })
            .await
    }

    async fn sismember(&self, k: &str, member: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let full = key(k);
        self.bounded("sismember", k, async move { conn.sismember(&full, member).await })
            .await
    }

    async fn sadd_capped(&self, k: &str, member: &str, max: u64) -> AppResult<CappedAdd> {
        let mut conn = self.conn.clone();
        let full = key(k);
        let script = Arc::clone(&self.capped_add);
        let reply: Vec<i64> = self
            .bounded("sadd_capped", k, async move {
                script
                    .key(&full)
                    .arg(member)
                    .arg(max)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        match reply.as_slice() {
            [0, size] => Ok(CappedAdd::Added { size: *size as u64 }),
            [1, size] => Ok(CappedAdd::AlreadyPresent { size: *size as u64 }),
            [2, size] => Ok(CappedAdd::Full { size: *size as u64 }),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "unexpected sadd_capped reply: {:?}",
                other
            ))),
        }
    }

    async fn rate_window(
        &self,
        k: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
        record: bool,
    ) -> AppResult<WindowState> {
        let mut conn = self.conn.clone();
        let full = key(k);
        let script = Arc::clone(&self.rate_window);
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());
        let reply: Vec<i64> = self
            .bounded("rate_window", k, async move {
                script
                    .key(&full)
                    .arg(now_ms)
                    .arg(window_ms)
                    .arg(limit)
                    .arg(if record { "1" } else { "0" })
                    .arg(&member)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        match reply.as_slice() {
            [allowed, count, oldest] => Ok(WindowState {
                allowed: *allowed == 1,
                count: *count as u64,
                oldest_ms: (*oldest >= 0).then_some(*oldest),
            }),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "unexpected rate_window reply: {:?}",
                other
            ))),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> AppResult<u64> {
        let mut conn = self.conn.clone();
        let full = channel_key(channel);
        let count: u64 = self
            .bounded("publish", channel, async move { conn.publish(&full, message).await })
            .await?;
        debug!(channel = %channel, count, "published");
        Ok(count)
    }

    async fn subscribe(&self, channel: &str) -> AppResult<BoxStream<'static, String>> {
        let client = Arc::clone(&self.client);
        let full = channel_key(channel);
        let pubsub = self
            .bounded("subscribe", channel, async move {
                let conn = client.get_async_connection().await?;
                let mut pubsub = conn.into_pubsub();
                pubsub.subscribe(&full).await?;
                Ok::<_, redis::RedisError>(pubsub)
            })
            .await?;
        info!(channel = %channel, "subscribed to redis channel");

        let channel = channel.to_string();
        let stream = pubsub
            .into_on_message()
            .filter_map(move |msg| {
                let payload = msg.get_payload::<String>();
                let channel = channel.clone();
                async move {
                    match payload {
                        Ok(payload) => Some(payload),
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "dropping non-utf8 pubsub payload");
                            None
                        }
                    }
                }
            })
            .boxed();
        Ok(stream)
    }
}
