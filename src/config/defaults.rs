//! Built-in defaults, matching the values production deployments start from

/// Pipeline worker pool size.
pub const PIPELINE_WORKERS: usize = 2;

/// Pipeline ingress queue capacity.
pub const PIPELINE_QUEUE_CAPACITY: usize = 1000;

/// Grace window for draining the pipeline queue on shutdown (milliseconds).
pub const PIPELINE_DRAIN_GRACE_MS: u64 = 5_000;

/// Per-lane persistence queue capacity (RDB / series / comm-stats).
pub const PERSISTENCE_QUEUE_CAPACITY: usize = 5_000;

/// Script executor: longest accepted formula, in bytes.
pub const SCRIPT_MAX_BYTES: usize = 16 * 1024;

/// Script executor: compiled-formula cache entries.
pub const SCRIPT_CACHE_CAPACITY: usize = 256;

/// Alarm recovery: publish batch size.
pub const RECOVERY_BATCH_SIZE: usize = 100;

/// Alarm recovery: delay between publish batches (milliseconds).
pub const RECOVERY_BATCH_DELAY_MS: u64 = 50;

/// Alarm recovery: publish retry attempts per batch.
pub const RECOVERY_RETRY_ATTEMPTS: u32 = 3;

/// Alarm recovery: backoff between retries (milliseconds).
pub const RECOVERY_RETRY_BACKOFF_MS: u64 = 500;

/// Circuit breaker: consecutive failures before opening.
pub const PROTECTOR_FAILURE_THRESHOLD: u32 = 5;

/// Circuit breaker: how long to stay open before probing (milliseconds).
pub const PROTECTOR_RECOVERY_TIMEOUT_MS: u64 = 60_000;

/// Circuit breaker: probe budget while half-open.
pub const PROTECTOR_HALF_OPEN_REQUESTS: u32 = 3;

/// Circuit breaker: retained failure timestamps for windowed rate queries.
pub const PROTECTOR_RECENT_FAILURES: usize = 100;

/// Gateway subscriber: worker threads draining the alarm queue.
pub const SUBSCRIBER_WORKERS: usize = 2;

/// Gateway subscriber: bounded alarm queue capacity.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 1_000;

/// Gateway subscriber: initial reconnect backoff (milliseconds).
pub const SUBSCRIBER_RECONNECT_BASE_MS: u64 = 1_000;

/// Gateway subscriber: reconnect backoff ceiling (milliseconds).
pub const SUBSCRIBER_RECONNECT_MAX_MS: u64 = 30_000;

/// Heartbeat period (seconds); the Redis key TTL is three periods.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Redis channel the pipeline publishes processed alarms on.
pub const CHANNEL_ALARMS_PROCESSED: &str = "alarms:processed";

/// Redis channel for global alarm fan-out.
pub const CHANNEL_ALARMS_ALL: &str = "alarms:all";

/// Per-gateway command channel prefix.
pub const CHANNEL_CMD_GATEWAY_PREFIX: &str = "cmd:gateway:";

/// Active-alarm key prefix (`alarm:active:<rule_id>`).
pub const KEY_ALARM_ACTIVE_PREFIX: &str = "alarm:active:";

/// Gateway heartbeat key prefix (`gateway:status:<gateway_id>`).
pub const KEY_GATEWAY_STATUS_PREFIX: &str = "gateway:status:";
