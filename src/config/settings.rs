//! Runtime configuration loaded from TOML with environment overrides

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use super::defaults;

/// Top-level configuration for both binaries. Missing sections fall back
/// to built-in defaults so a bare deployment starts without a file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// "block" or "reject" — what a full ingress queue does to the driver.
    pub overflow: String,
    pub drain_grace_ms: u64,
    pub persistence_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: defaults::PIPELINE_WORKERS,
            queue_capacity: defaults::PIPELINE_QUEUE_CAPACITY,
            overflow: "block".to_string(),
            drain_grace_ms: defaults::PIPELINE_DRAIN_GRACE_MS,
            persistence_queue_capacity: defaults::PERSISTENCE_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub enabled: bool,
    /// all | critical_only | high_and_critical | tenant | time_window
    pub policy: String,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: "all".to_string(),
            batch_size: defaults::RECOVERY_BATCH_SIZE,
            batch_delay_ms: defaults::RECOVERY_BATCH_DELAY_MS,
            retry_attempts: defaults::RECOVERY_RETRY_ATTEMPTS,
            retry_backoff_ms: defaults::RECOVERY_RETRY_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub gateway_id: i64,
    pub subscriber_workers: usize,
    pub subscriber_queue_capacity: usize,
    pub heartbeat_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_id: 0,
            subscriber_workers: defaults::SUBSCRIBER_WORKERS,
            subscriber_queue_capacity: defaults::SUBSCRIBER_QUEUE_CAPACITY,
            heartbeat_interval_secs: defaults::HEARTBEAT_INTERVAL_SECS,
        }
    }
}

impl AppConfig {
    /// Load configuration, in order of precedence:
    ///
    /// 1. explicit path argument
    /// 2. `PULSEONE_CONFIG` environment variable
    /// 3. `pulseone.toml` in the working directory
    /// 4. built-in defaults
    ///
    /// `REDIS_URL` overrides the file's redis section either way.
    pub fn load(path: Option<&Path>) -> Self {
        let candidate = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("PULSEONE_CONFIG").ok().map(Into::into))
            .unwrap_or_else(|| "pulseone.toml".into());

        let mut config = match std::fs::read_to_string(&candidate) {
            Ok(text) => match toml::from_str::<AppConfig>(&text) {
                Ok(cfg) => {
                    info!(path = %candidate.display(), "Configuration loaded");
                    cfg
                }
                Err(e) => {
                    warn!(path = %candidate.display(), error = %e, "Invalid config file — using defaults");
                    AppConfig::default()
                }
            },
            Err(_) => {
                info!(path = %candidate.display(), "No config file — using defaults");
                AppConfig::default()
            }
        };

        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                config.redis.url = url;
            }
        }
        if let Ok(id) = std::env::var("GATEWAY_ID") {
            if let Ok(id) = id.parse() {
                config.gateway.gateway_id = id;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.pipeline.worker_count, 2);
        assert_eq!(cfg.pipeline.overflow, "block");
        assert!(cfg.recovery.enabled);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [pipeline]
            worker_count = 4
            queue_capacity = 100
            overflow = "reject"
            drain_grace_ms = 1000
            persistence_queue_capacity = 500
            "#,
        )
        .unwrap();
        assert_eq!(cfg.pipeline.worker_count, 4);
        assert_eq!(cfg.redis.url, "redis://127.0.0.1:6379");
    }
}
