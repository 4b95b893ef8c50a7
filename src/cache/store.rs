//! Key/value stores behind the odds cache.
//!
//! - `ValkeyStore`: Valkey (Redis-compatible), namespaced under a prefix
//!   so several instances can share one server.
//! - `MemoryStore`: in-process map with per-key expiry, for tests and for
//!   running without a server.
//!
//! Writes are plain `SET EX`; last writer wins on the same key.

use crate::error::EngineError;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),
}

impl From<CacheError> for EngineError {
    fn from(e: CacheError) -> Self {
        EngineError::CacheUnavailable(e.to_string())
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    /// Keys matching a glob pattern (`*` wildcard). Not for the hot path.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError>;
}

/// Valkey-backed store.
///
/// All keys are namespaced: "{prefix}:{key}". `scan` returns keys with the
/// prefix removed, so callers only ever see their own key space.
#[derive(Clone)]
pub struct ValkeyStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl ValkeyStore {
    /// Connect to Valkey/Redis.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = url, prefix = prefix, "connected to Valkey");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    /// Build a namespaced key: "{prefix}:{suffix}"
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    /// Test connectivity.
    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(response = %pong, "Valkey ping");
        Ok(())
    }
}

#[async_trait]
impl CacheStore for ValkeyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(self.key(key), value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let full = self.key(pattern);
        let strip = format!("{}:", self.prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            keys.extend(
                batch
                    .into_iter()
                    .map(|k| k.strip_prefix(&strip).map(str::to_string).unwrap_or(k)),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

/// In-process store with per-key expiry.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, (Instant, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let expired = match self.entries.get(key) {
            Some(e) if Instant::now() < e.value().0 => return Ok(Some(e.value().1.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), (Instant::now() + ttl, value.to_string()));
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| now < e.value().0 && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// `*` matches any run of characters; everything else is literal.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return part.is_empty() || rest.ends_with(part);
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}
