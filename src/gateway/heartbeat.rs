//! Heartbeat service
//!
//! Periodic liveness: `edge_servers.last_seen`/`status` in the RDB plus a
//! `gateway:status:<id>` JSON key in Redis with TTL three intervals.
//! Failures are logged and retried at the next tick.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::KEY_GATEWAY_STATUS_PREFIX;
use crate::storage::{EdgeServerRepository, RedisSink};

pub struct HeartbeatService {
    gateway_id: i64,
    interval: Duration,
    edge_servers: Arc<dyn EdgeServerRepository>,
    redis: Arc<dyn RedisSink>,
}

impl HeartbeatService {
    pub fn new(
        gateway_id: i64,
        interval_secs: u64,
        edge_servers: Arc<dyn EdgeServerRepository>,
        redis: Arc<dyn RedisSink>,
    ) -> Self {
        Self {
            gateway_id,
            interval: Duration::from_secs(interval_secs.max(1)),
            edge_servers,
            redis,
        }
    }

    pub fn status_key(gateway_id: i64) -> String {
        format!("{}{}", KEY_GATEWAY_STATUS_PREFIX, gateway_id)
    }

    /// One beat: RDB touch + Redis status key. Public so the gateway can
    /// force an immediate beat outside the loop.
    pub async fn update_once(&self) {
        if self.gateway_id <= 0 {
            return;
        }

        if let Err(e) = self.edge_servers.touch(self.gateway_id).await {
            warn!(gateway_id = self.gateway_id, error = %e, "Heartbeat RDB update failed");
        }

        let status = json!({
            "status": "online",
            "gateway_id": self.gateway_id,
            "last_seen": chrono::Utc::now().timestamp(),
            "hostname": std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        });
        let ttl = self.interval.as_secs() * 3;
        if let Err(e) = self
            .redis
            .set_ex(&Self::status_key(self.gateway_id), &status.to_string(), ttl)
            .await
        {
            warn!(gateway_id = self.gateway_id, error = %e, "Heartbeat Redis update failed");
        } else {
            debug!(gateway_id = self.gateway_id, "Heartbeat written");
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(gateway_id = self.gateway_id, interval_secs = self.interval.as_secs(), "Heartbeat started");
        loop {
            self.update_once().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!(gateway_id = self.gateway_id, "Heartbeat stopped");
    }
}
