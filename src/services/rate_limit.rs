//! Per `(identity, action)` request windows kept in the shared store.
//!
//! Each check prunes entries older than the window, counts the survivors and
//! admits the request only while `count < limit`. Prune, count and record run
//! as one atomic store operation.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::{RateAction, RateLimitExceeded, RateLimitStatus};
use crate::repositories::{EphemeralStore, WindowState};

/// How long a custom limit stays in force once set.
const CUSTOM_LIMIT_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Time source, swappable so windows can be moved forward in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u64,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    fn window_ms(&self) -> i64 {
        self.window.as_millis().min(i64::MAX as u128) as i64
    }
}

/// Escape characters that would act as glob syntax or key separators.
fn encode_identity(identity: &str) -> String {
    let mut out = String::with_capacity(identity.len());
    for c in identity.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '*' => out.push_str("%2A"),
            '?' => out.push_str("%3F"),
            '[' => out.push_str("%5B"),
            ']' => out.push_str("%5D"),
            '\\' => out.push_str("%5C"),
            c => out.push(c),
        }
    }
    out
}

fn window_key(identity: &str, action: RateAction) -> String {
    format!("ratelimit:w:{}:{}", encode_identity(identity), action)
}

fn custom_key(identity: &str, action: RateAction) -> String {
    format!("ratelimit:c:{}:{}", encode_identity(identity), action)
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    defaults: Arc<HashMap<RateAction, RateLimit>>,
}

impl RateLimiter {
    /// Actions missing from `defaults` are not limited.
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
        defaults: HashMap<RateAction, RateLimit>,
    ) -> Self {
        Self {
            store,
            clock,
            defaults: Arc::new(defaults),
        }
    }

    /// Record an attempt; fail with [`AppError::RateLimited`] once the window is full.
    pub async fn check_rate_limit(
        &self,
        identity: &str,
        action: RateAction,
    ) -> AppResult<RateLimitStatus> {
        let Some(limit) = self.limit_for(identity, action).await? else {
            return Ok(self.unlimited());
        };
        let now = self.clock.now();
        let state = self.window(identity, action, limit, now, true).await?;
        let status = self.status(limit, &state, now);
        if !state.allowed {
            let retry_after_secs = (status.reset_at - now).num_milliseconds().max(0) as u64;
            let retry_after_secs = retry_after_secs.div_ceil(1000).max(1);
            warn!(identity = %identity, action = %action, limit = limit.limit, retry_after_secs, "rate limit exceeded");
            return Err(AppError::RateLimited(RateLimitExceeded {
                identity: identity.to_string(),
                action,
                limit: limit.limit,
                retry_after_secs,
                reset_at: status.reset_at,
            }));
        }
        debug!(identity = %identity, action = %action, remaining = status.remaining, "rate limit ok");
        Ok(status)
    }

    /// Would the next attempt be admitted? Records nothing.
    pub async fn is_allowed(&self, identity: &str, action: RateAction) -> AppResult<bool> {
        let Some(limit) = self.limit_for(identity, action).await? else {
            return Ok(true);
        };
        let state = self
            .window(identity, action, limit, self.clock.now(), false)
            .await?;
        Ok(state.allowed)
    }

    pub async fn get_remaining(&self, identity: &str, action: RateAction) -> AppResult<u64> {
        let Some(limit) = self.limit_for(identity, action).await? else {
            return Ok(u64::MAX);
        };
        let state = self
            .window(identity, action, limit, self.clock.now(), false)
            .await?;
        Ok(limit.limit.saturating_sub(state.count))
    }

    /// When the oldest attempt in the window ages out. Now, if the window is empty.
    pub async fn get_window_reset_time(
        &self,
        identity: &str,
        action: RateAction,
    ) -> AppResult<DateTime<Utc>> {
        let now = self.clock.now();
        let Some(limit) = self.limit_for(identity, action).await? else {
            return Ok(now);
        };
        let state = self.window(identity, action, limit, now, false).await?;
        Ok(self.status(limit, &state, now).reset_at)
    }

    /// Forget every window and custom limit for the identity.
    pub async fn clear_limits(&self, identity: &str) -> AppResult<usize> {
        let encoded = encode_identity(identity);
        let mut cleared = 0;
        for pattern in [
            format!("ratelimit:w:{}:*", encoded),
            format!("ratelimit:c:{}:*", encoded),
        ] {
            for key in self.store.keys(&pattern).await? {
                if self.store.del(&key).await? {
                    cleared += 1;
                }
            }
        }
        info!(identity = %identity, cleared, "rate limits cleared");
        Ok(cleared)
    }

    /// Override the default limit for one identity and action. The action's
    /// default window still applies.
    pub async fn set_custom_limit(
        &self,
        identity: &str,
        action: RateAction,
        limit: u64,
    ) -> AppResult<()> {
        self.store
            .set_ex(&custom_key(identity, action), &limit.to_string(), CUSTOM_LIMIT_TTL)
            .await?;
        info!(identity = %identity, action = %action, limit, "custom rate limit set");
        Ok(())
    }

    async fn limit_for(&self, identity: &str, action: RateAction) -> AppResult<Option<RateLimit>> {
        let Some(default) = self.defaults.get(&action).copied() else {
            return Ok(None);
        };
        let custom = self
            .store
            .get(&custom_key(identity, action))
            .await?
            .and_then(|raw| raw.parse::<u64>().ok());
        Ok(Some(match custom {
            Some(limit) => RateLimit::new(limit, default.window),
            None => default,
        }))
    }

    async fn window(
        &self,
        identity: &str,
        action: RateAction,
        limit: RateLimit,
        now: DateTime<Utc>,
        record: bool,
    ) -> AppResult<WindowState> {
        self.store
            .rate_window(
                &window_key(identity, action),
                now.timestamp_millis(),
                limit.window_ms(),
                limit.limit,
                record,
            )
            .await
    }

    fn status(&self, limit: RateLimit, state: &WindowState, now: DateTime<Utc>) -> RateLimitStatus {
        let reset_at = state
            .oldest_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms + limit.window_ms()).single())
            .unwrap_or(now);
        RateLimitStatus {
            limit: limit.limit,
            remaining: limit.limit.saturating_sub(state.count),
            reset_at,
        }
    }

    fn unlimited(&self) -> RateLimitStatus {
        RateLimitStatus {
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_at: self.clock.now(),
        }
    }
}
