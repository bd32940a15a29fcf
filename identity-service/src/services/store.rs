//! Shared state used across server processes: sliding-window admission logs
//! and single-use markers. Every mutation is a single atomic step against the
//! store, never a read followed by a write.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client, Script};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::clock::{Clock, SystemClock};

/// Result of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmission {
    pub allowed: bool,
    /// Entries in the window after this attempt.
    pub count: u32,
    /// Time until the oldest entry leaves the window. Zero when allowed.
    pub retry_after: Duration,
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Records an attempt under `key` iff fewer than `limit` attempts were
    /// recorded in the trailing `window`. Check and record are one step.
    async fn admit_in_window(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowAdmission, anyhow::Error>;

    /// Sets `key` only if it does not hold a live value. Returns whether this
    /// call set it.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, anyhow::Error>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), anyhow::Error>;

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;

    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error>;

    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

// Sliding log on a sorted set scored by server time in ms.
// Returns {allowed, count, retry_after_ms}.
const ADMIT_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
if count < limit then
  redis.call('ZADD', KEYS[1], now, ARGV[3])
  redis.call('PEXPIRE', KEYS[1], window)
  return {1, count + 1, 0}
end
local retry = window
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if oldest[2] then
  retry = tonumber(oldest[2]) + window - now
end
return {0, count, retry}
"#;

#[derive(Clone)]
pub struct RedisStore {
    _client: Client,
    manager: ConnectionManager,
    admit: Arc<Script>,
}

impl RedisStore {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
            admit: Arc::new(Script::new(ADMIT_SCRIPT)),
        })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn admit_in_window(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowAdmission, anyhow::Error> {
        let mut conn = self.manager.clone();
        let reply: Vec<i64> = self
            .admit
            .key(key)
            .arg(ttl_ms(window))
            .arg(limit)
            .arg(Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to run admission script: {}", e))?;

        match reply.as_slice() {
            [allowed, count, retry] => Ok(WindowAdmission {
                allowed: *allowed == 1,
                count: (*count).max(0) as u32,
                retry_after: Duration::from_millis((*retry).max(0) as u64),
            }),
            other => Err(anyhow::anyhow!("Unexpected admission reply: {:?}", other)),
        }
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to set marker: {}", e))?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to set value: {}", e))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get value: {}", e))
    }

    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to check key: {}", e))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

struct SlidingLog {
    window_ms: i64,
    entries: VecDeque<i64>,
}

const SWEEP_EVERY: u64 = 1024;

/// Process-local store for tests and single-node deployments.
///
/// Atomicity comes from the per-key entry lock of `DashMap`; no lock is held
/// across an await point.
pub struct InMemoryStore {
    windows: DashMap<String, SlidingLog>,
    values: DashMap<String, (String, i64)>,
    clock: Arc<dyn Clock>,
    ops: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            values: DashMap::new(),
            clock,
            ops: AtomicU64::new(0),
        }
    }

    /// Number of keys currently held, expired or not.
    pub fn key_count(&self) -> usize {
        self.windows.len() + self.values.len()
    }

    /// Drops expired values and logs whose newest entry left the window.
    pub fn sweep(&self) {
        let now = self.clock.now_ms();
        self.windows
            .retain(|_, log| log.entries.back().is_some_and(|&t| t > now - log.window_ms));
        self.values.retain(|_, (_, expires)| *expires > now);
    }

    fn tick(&self) {
        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep();
        }
    }

    fn live_value(&self, key: &str, now: i64) -> Option<String> {
        self.values
            .get(key)
            .filter(|v| v.1 > now)
            .map(|v| v.0.clone())
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn admit_in_window(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowAdmission, anyhow::Error> {
        let now = self.clock.now_ms();
        let window_ms = ttl_ms(window) as i64;
        let admission = {
            let mut log = self.windows.entry(key.to_string()).or_insert_with(|| SlidingLog {
                window_ms,
                entries: VecDeque::new(),
            });
            log.window_ms = window_ms;
            while log.entries.front().is_some_and(|&t| t <= now - window_ms) {
                log.entries.pop_front();
            }
            let count = log.entries.len() as u32;
            if count < limit {
                log.entries.push_back(now);
                WindowAdmission {
                    allowed: true,
                    count: count + 1,
                    retry_after: Duration::ZERO,
                }
            } else {
                let retry_ms = log
                    .entries
                    .front()
                    .map(|&oldest| oldest + window_ms - now)
                    .unwrap_or(window_ms);
                WindowAdmission {
                    allowed: false,
                    count,
                    retry_after: Duration::from_millis(retry_ms.max(0) as u64),
                }
            }
        };
        self.tick();
        Ok(admission)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error> {
        let now = self.clock.now_ms();
        let expires = now + ttl_ms(ttl) as i64;
        let inserted = match self.values.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().1 > now {
                    false
                } else {
                    occupied.insert((value.to_string(), expires));
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert((value.to_string(), expires));
                true
            }
        };
        self.tick();
        Ok(inserted)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), anyhow::Error> {
        let expires = self.clock.now_ms() + ttl_ms(ttl) as i64;
        self.values
            .insert(key.to_string(), (value.to_string(), expires));
        self.tick();
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        Ok(self.live_value(key, self.clock.now_ms()))
    }

    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error> {
        Ok(self.live_value(key, self.clock.now_ms()).is_some())
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
