//! Single-process [`EphemeralStore`]: same semantics as Redis, one lock over the
//! whole keyspace. Used by tests and `STORAGE_MODE=memory`; never shared across
//! processes.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use super::store::{CappedAdd, EphemeralStore, WindowState};
use crate::error::{AppError, AppResult};

#[derive(Debug)]
enum Value {
    Str(String),
    Set(HashSet<String>),
    Log(VecDeque<i64>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type Keyspace = HashMap<String, Entry>;

fn wrong_type(key: &str) -> AppError {
    AppError::Internal(anyhow::anyhow!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

/// Drop the key if it has expired, then hand back what is left.
fn live<'a>(keys: &'a mut Keyspace, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if keys.get(key).is_some_and(|e| e.is_expired(now)) {
        keys.remove(key);
    }
    keys.get_mut(key)
}

fn set_of<'a>(keys: &'a mut Keyspace, key: &str) -> AppResult<Option<&'a mut HashSet<String>>> {
    match live(keys, key) {
        None => Ok(None),
        Some(Entry { value: Value::Set(set), .. }) => Ok(Some(set)),
        Some(_) => Err(wrong_type(key)),
    }
}

/// Glob match supporting `*` only, which is all the key layout needs.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return false,
    };
    let Some(mut remaining) = text.strip_prefix(first) else {
        return false;
    };
    let (last, middle) = match rest.split_last() {
        Some(split) => split,
        None => return false,
    };
    for part in middle {
        match remaining.find(part) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}

/// In-memory [`EphemeralStore`]. Clones share the same keyspace.
#[derive(Clone)]
pub struct MemoryStore {
    keys: Arc<Mutex<Keyspace>>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    channel_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MemoryStore {
    /// `channel_capacity` bounds how far a slow subscriber may lag before it
    /// starts missing messages.
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashMap::new())),
            channels: Arc::new(Mutex::new(HashMap::new())),
            channel_capacity: channel_capacity.max(1),
        }
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let mut keys = self.keys.lock().await;
        keys.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn replace_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let mut keys = self.keys.lock().await;
        match live(&mut keys, key) {
            Some(entry) => {
                entry.value = Value::Str(value.to_string());
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut keys = self.keys.lock().await;
        match live(&mut keys, key) {
            None => Ok(None),
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        let mut keys = self.keys.lock().await;
        match live(&mut keys, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> AppResult<bool> {
        let mut keys = self.keys.lock().await;
        Ok(live(&mut keys, key).is_some() && keys.remove(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> AppResult<Vec<String>> {
        let mut keys = self.keys.lock().await;
        let now = Instant::now();
        keys.retain(|_, e| !e.is_expired(now));
        let mut found: Vec<String> = keys
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        found.sort();
        Ok(found)
    }

    async fn sadd(&self, key: &str, member: &str) -> AppResult<bool> {
        let mut keys = self.keys.lock().await;
        if let Some(set) = set_of(&mut keys, key)? {
            return Ok(set.insert(member.to_string()));
        }
        keys.insert(
            key.to_string(),
            Entry {
                value: Value::Set(HashSet::from([member.to_string()])),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn srem(&self, key: &str, member: &str) -> AppResult<bool> {
        let mut keys = self.keys.lock().await;
        let (removed, now_empty) = match set_of(&mut keys, key)? {
            Some(set) => (set.remove(member), set.is_empty()),
            None => (false, false),
        };
        // Redis deletes a set once its last member goes.
        if now_empty {
            keys.remove(key);
        }
        Ok(removed)
    }

    async fn scard(&self, key: &str) -> AppResult<u64> {
        let mut keys = self.keys.lock().await;
        Ok(set_of(&mut keys, key)?.map_or(0, |s| s.len() as u64))
    }

    async fn smembers(&self, key: &str) -> AppResult<Vec<String>> {
        let mut keys = self.keys.lock().await;
        Ok(set_of(&mut keys, key)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> AppResult<bool> {
        let mut keys = self.keys.lock().await;
        Ok(set_of(&mut keys, key)?.is_some_and(|s| s.contains(member)))
    }

    async fn sadd_capped(&self, key: &str, member: &str, max: u64) -> AppResult<CappedAdd> {
        let mut keys = self.keys.lock().await;
        if let Some(set) = set_of(&mut keys, key)? {
            let size = set.len() as u64;
            if set.contains(member) {
                return Ok(CappedAdd::AlreadyPresent { size });
            }
            if size >= max {
                return Ok(CappedAdd::Full { size });
            }
            set.insert(member.to_string());
            return Ok(CappedAdd::Added { size: size + 1 });
        }
        if max == 0 {
            return Ok(CappedAdd::Full { size: 0 });
        }
        keys.insert(
            key.to_string(),
            Entry {
                value: Value::Set(HashSet::from([member.to_string()])),
                expires_at: None,
            },
        );
        Ok(CappedAdd::Added { size: 1 })
    }

    async fn rate_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
        record: bool,
    ) -> AppResult<WindowState> {
        let mut keys = self.keys.lock().await;
        let now = Instant::now();
        if keys.get(key).is_some_and(|e| e.is_expired(now)) {
            keys.remove(key);
        }
        let entry = keys.entry(key.to_string()).or_insert(Entry {
            value: Value::Log(VecDeque::new()),
            expires_at: None,
        });
        let Value::Log(log) = &mut entry.value else {
            return Err(wrong_type(key));
        };

        let cutoff = now_ms - window_ms;
        log.retain(|&ts| ts > cutoff);
        let allowed = (log.len() as u64) < limit;
        if allowed && record {
            log.push_back(now_ms);
            entry.expires_at = Some(Instant::now() + Duration::from_millis(window_ms.max(1) as u64));
        }
        let state = WindowState {
            allowed,
            count: log.len() as u64,
            oldest_ms: log.iter().copied().min(),
        };
        let empty = log.is_empty();
        if empty {
            keys.remove(key);
        }
        Ok(state)
    }

    async fn publish(&self, channel: &str, message: &str) -> AppResult<u64> {
        let mut channels = self.channels.lock().await;
        let count = match channels.get(channel) {
            Some(tx) => tx.send(message.to_string()).unwrap_or(0) as u64,
            None => 0,
        };
        if count == 0 {
            channels.remove(channel);
        }
        debug!(channel = %channel, count, "published");
        Ok(count)
    }

    async fn subscribe(&self, channel: &str) -> AppResult<BoxStream<'static, String>> {
        let rx = {
            let mut channels = self.channels.lock().await;
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
                .subscribe()
        };
        let channel = channel.to_string();
        let stream = stream::unfold((rx, channel), |(mut rx, channel)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, (rx, channel))),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(channel = %channel, lagged = n, "subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns() {
        assert!(glob_match("poi:*:members", "poi:abc:members"));
        assert!(!glob_match("poi:*:members", "poi:abc:other"));
        assert!(glob_match("ratelimit:u1:*", "ratelimit:u1:join_poi"));
        assert!(!glob_match("ratelimit:u1:*", "ratelimit:u10"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("a*a", "a"));
    }

    #[tokio::test]
    async fn ttl_expires_keys() {
        let store = MemoryStore::default();
        store.set_ex("k", "v", Duration::from_millis(30)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.replace_ex("k", "w", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn capped_add_respects_max() {
        let store = MemoryStore::default();
        assert_eq!(store.sadd_capped("s", "a", 2).await.unwrap(), CappedAdd::Added { size: 1 });
        assert_eq!(
            store.sadd_capped("s", "a", 2).await.unwrap(),
            CappedAdd::AlreadyPresent { size: 1 }
        );
        assert_eq!(store.sadd_capped("s", "b", 2).await.unwrap(), CappedAdd::Added { size: 2 });
        assert_eq!(store.sadd_capped("s", "c", 2).await.unwrap(), CappedAdd::Full { size: 2 });
    }

    #[tokio::test]
    async fn set_removed_when_empty() {
        let store = MemoryStore::default();
        store.sadd("s", "a").await.unwrap();
        assert!(store.srem("s", "a").await.unwrap());
        assert!(store.keys("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rate_window_prunes_old_entries() {
        let store = MemoryStore::default();
        for t in 0..3 {
            assert!(store.rate_window("r", t, 100, 3, true).await.unwrap().allowed);
        }
        let full = store.rate_window("r", 50, 100, 3, true).await.unwrap();
        assert!(!full.allowed);
        assert_eq!(full.count, 3);
        assert_eq!(full.oldest_ms, Some(0));

        let later = store.rate_window("r", 101, 100, 3, true).await.unwrap();
        assert!(later.allowed);
        assert_eq!(later.oldest_ms, Some(2));
    }

    #[tokio::test]
    async fn pubsub_fans_out_to_every_subscriber() {
        let store = MemoryStore::default();
        let mut a = store.subscribe("c").await.unwrap();
        let mut b = store.subscribe("c").await.unwrap();
        assert_eq!(store.publish("c", "hello").await.unwrap(), 2);
        assert_eq!(a.next().await.as_deref(), Some("hello"));
        assert_eq!(b.next().await.as_deref(), Some("hello"));
        drop(a);
        drop(b);
        assert_eq!(store.publish("c", "again").await.unwrap(), 0);
    }
}
