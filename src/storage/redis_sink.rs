//! Redis access seam
//!
//! Everything that touches Redis goes through [`RedisSink`] so the writer,
//! recovery, heartbeat, and tests all share one surface. The production
//! implementation wraps the multiplexed `ConnectionManager`; tests use
//! [`MemorySink`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RedisError {
    #[error("redis unavailable: {0}")]
    Unavailable(String),
    #[error("redis command failed: {0}")]
    Command(String),
}

impl From<redis::RedisError> for RedisError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            RedisError::Unavailable(e.to_string())
        } else {
            RedisError::Command(e.to_string())
        }
    }
}

/// Minimal key/value + pub/sub surface the platform needs.
#[async_trait]
pub trait RedisSink: Send + Sync {
    async fn set(&self, key: &str, value: &str) -> Result<(), RedisError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), RedisError>;
    async fn get(&self, key: &str) -> Result<Option<String>, RedisError>;
    async fn del(&self, key: &str) -> Result<(), RedisError>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), RedisError>;
}

/// Production sink over a multiplexed connection manager.
///
/// `ConnectionManager` reconnects internally, so a clone per caller is the
/// library's intended sharing model.
pub struct RedisConnection {
    manager: redis::aio::ConnectionManager,
}

impl RedisConnection {
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        let client = redis::Client::open(url).map_err(|e| RedisError::Unavailable(e.to_string()))?;
        let manager = client.get_connection_manager().await?;
        info!(url = url, "Redis connection established");
        Ok(Self { manager })
    }
}

#[async_trait]
impl RedisSink for RedisConnection {
    async fn set(&self, key: &str, value: &str) -> Result<(), RedisError> {
        let mut conn = self.manager.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), RedisError> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RedisError> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    async fn del(&self, key: &str) -> Result<(), RedisError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), RedisError> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }
}

/// In-memory sink for tests: records keys and published messages.
#[derive(Default)]
pub struct MemorySink {
    keys: Mutex<HashMap<String, String>>,
    published: Mutex<Vec<(String, String)>>,
    /// When set, every operation fails as if Redis were down.
    pub fail: std::sync::atomic::AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(&self, key: &str) -> Option<String> {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// All `(channel, payload)` pairs published so far.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn published_on(&self, channel: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p)
            .collect()
    }

    fn check(&self) -> Result<(), RedisError> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            Err(RedisError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RedisSink for MemorySink {
    async fn set(&self, key: &str, value: &str) -> Result<(), RedisError> {
        self.check()?;
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, _ttl_secs: u64) -> Result<(), RedisError> {
        self.set(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RedisError> {
        self.check()?;
        Ok(self.key(key))
    }

    async fn del(&self, key: &str) -> Result<(), RedisError> {
        self.check()?;
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), RedisError> {
        self.check()?;
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((channel.to_string(), payload.to_string()));
        Ok(())
    }
}
