//! Alarm startup recovery
//!
//! On boot, active alarms exist only as RDB rows; backend subscribers and
//! gateways have lost their Redis view. Recovery republishes every
//! qualifying occurrence to `alarms:processed` (restoring the
//! `alarm:active:*` keys along the way) and seeds the state cache so the
//! evaluator agrees with the database about what is already active.
//!
//! Publishing runs in batches with retry; pause/resume/cancel flags are
//! honored between items. Redis being down makes recovery report failures,
//! not abort the boot.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::storage::{AlarmOccurrenceRepository, CurrentValueRepository, RedisDataWriter};
use crate::types::{AlarmEventData, AlarmOccurrence, AlarmSeverity};

use super::state_cache::AlarmStateCache;

/// Which active alarms qualify for republication.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RecoveryPolicy {
    #[default]
    AllActiveAlarms,
    CriticalOnly,
    HighAndCritical,
    TenantSpecific(Vec<i32>),
    TimeWindow(DateTime<Utc>, DateTime<Utc>),
}

impl RecoveryPolicy {
    pub fn parse(name: &str) -> Self {
        match name {
            "critical_only" => Self::CriticalOnly,
            "high_and_critical" => Self::HighAndCritical,
            _ => Self::AllActiveAlarms,
        }
    }
}

/// Counters for the most recent recovery run.
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub total_active_alarms: usize,
    pub successfully_published: usize,
    pub failed_to_publish: usize,
    pub invalid_alarms: usize,
    pub duplicates_skipped: usize,
    pub recovery_duration_ms: u64,
    pub last_recovery_time: Option<DateTime<Utc>>,
    pub last_error: String,
}

pub struct AlarmStartupRecovery {
    occurrences: Arc<dyn AlarmOccurrenceRepository>,
    writer: Arc<RedisDataWriter>,
    state_cache: Arc<AlarmStateCache>,
    config: RecoveryConfig,

    policy: Mutex<RecoveryPolicy>,
    min_severity: Mutex<Option<AlarmSeverity>>,
    duplicate_detection: AtomicBool,
    priority_recovery: AtomicBool,

    paused: AtomicBool,
    cancelled: AtomicBool,
    completed: AtomicBool,
    /// Progress 0.0–1.0, stored as f64 bits.
    progress: AtomicU64,

    processed_ids: Mutex<HashSet<i64>>,
    stats: Mutex<RecoveryStats>,
}

impl AlarmStartupRecovery {
    pub fn new(
        occurrences: Arc<dyn AlarmOccurrenceRepository>,
        writer: Arc<RedisDataWriter>,
        state_cache: Arc<AlarmStateCache>,
        config: RecoveryConfig,
    ) -> Self {
        let policy = RecoveryPolicy::parse(&config.policy);
        Self {
            occurrences,
            writer,
            state_cache,
            config,
            policy: Mutex::new(policy),
            min_severity: Mutex::new(None),
            duplicate_detection: AtomicBool::new(true),
            priority_recovery: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            progress: AtomicU64::new(0),
            processed_ids: Mutex::new(HashSet::new()),
            stats: Mutex::new(RecoveryStats::default()),
        }
    }

    pub fn set_policy(&self, policy: RecoveryPolicy) {
        *self.policy.lock().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    pub fn set_severity_filter(&self, min: AlarmSeverity) {
        *self.min_severity.lock().unwrap_or_else(|e| e.into_inner()) = Some(min);
    }

    pub fn disable_severity_filter(&self) {
        *self.min_severity.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn enable_duplicate_detection(&self, enable: bool) {
        self.duplicate_detection.store(enable, Ordering::Relaxed);
    }

    pub fn enable_priority_recovery(&self, enable: bool) {
        self.priority_recovery.store(enable, Ordering::Relaxed);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Relaxed)
    }

    /// Progress through the current run, 0.0–1.0.
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = RecoveryStats::default();
    }

    pub fn processed_ids(&self) -> Vec<i64> {
        self.processed_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    pub fn clear_processed_cache(&self) {
        self.processed_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn diagnostic_info(&self) -> serde_json::Value {
        let stats = self.stats();
        json!({
            "completed": self.is_completed(),
            "paused": self.is_paused(),
            "cancelled": self.cancelled.load(Ordering::Relaxed),
            "progress": self.progress(),
            "processed_ids": self.processed_ids().len(),
            "stats": {
                "total_active_alarms": stats.total_active_alarms,
                "successfully_published": stats.successfully_published,
                "failed_to_publish": stats.failed_to_publish,
                "invalid_alarms": stats.invalid_alarms,
                "duplicates_skipped": stats.duplicates_skipped,
                "recovery_duration_ms": stats.recovery_duration_ms,
                "last_error": stats.last_error,
            },
        })
    }

    /// Main entry point: republish active alarms. Returns how many were
    /// successfully published.
    pub async fn recover_active_alarms(&self) -> usize {
        if !self.config.enabled {
            info!("Alarm recovery disabled by configuration");
            return 0;
        }
        let start = std::time::Instant::now();
        self.cancelled.store(false, Ordering::Relaxed);
        self.completed.store(false, Ordering::Relaxed);
        self.set_progress(0.0);

        let active = match self.occurrences.find_active().await {
            Ok(active) => active,
            Err(e) => {
                warn!(error = %e, "Could not load active alarms for recovery");
                let mut stats = self.stats.lock().unwrap_or_else(|err| err.into_inner());
                stats.last_error = e.to_string();
                return 0;
            }
        };

        let total = active.len();
        let mut candidates: Vec<AlarmOccurrence> = Vec::with_capacity(total);
        let mut invalid = 0usize;
        let mut duplicates = 0usize;

        {
            let policy = self.policy.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let min_severity = *self.min_severity.lock().unwrap_or_else(|e| e.into_inner());
            let dedup = self.duplicate_detection.load(Ordering::Relaxed);
            let mut processed = self.processed_ids.lock().unwrap_or_else(|e| e.into_inner());

            for occurrence in active {
                if !Self::validate(&occurrence) {
                    invalid += 1;
                    continue;
                }
                if !Self::policy_allows(&policy, &occurrence) {
                    continue;
                }
                if let Some(min) = min_severity {
                    if occurrence.severity < min {
                        continue;
                    }
                }
                if dedup && !processed.insert(occurrence.id) {
                    duplicates += 1;
                    continue;
                }
                candidates.push(occurrence);
            }
        }

        if self.priority_recovery.load(Ordering::Relaxed) {
            candidates.sort_by(|a, b| b.severity.cmp(&a.severity));
        }

        info!(
            total_active = total,
            selected = candidates.len(),
            invalid,
            duplicates,
            "Starting alarm recovery"
        );

        let mut published = 0usize;
        let mut failed = 0usize;
        let selected = candidates.len();

        for (index, chunk) in candidates.chunks(self.config.batch_size.max(1)).enumerate() {
            if index > 0 {
                sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
            }
            for occurrence in chunk {
                if self.cancelled.load(Ordering::Relaxed) {
                    break;
                }
                while self.paused.load(Ordering::Relaxed)
                    && !self.cancelled.load(Ordering::Relaxed)
                {
                    sleep(Duration::from_millis(50)).await;
                }

                let event = AlarmEventData::from_occurrence(occurrence);
                if self.publish_with_retry(&event).await {
                    self.state_cache
                        .set_alarm_status(occurrence.rule_id, true, occurrence.id);
                    published += 1;
                } else {
                    failed += 1;
                }

                let done = published + failed;
                if selected > 0 {
                    self.set_progress(done as f64 / selected as f64);
                }
            }
            if self.cancelled.load(Ordering::Relaxed) {
                warn!("Alarm recovery cancelled");
                break;
            }
        }

        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.total_active_alarms = total;
            stats.successfully_published = published;
            stats.failed_to_publish = failed;
            stats.invalid_alarms = invalid;
            stats.duplicates_skipped = duplicates;
            stats.recovery_duration_ms = start.elapsed().as_millis() as u64;
            stats.last_recovery_time = Some(Utc::now());
            if failed > 0 && stats.last_error.is_empty() {
                stats.last_error = format!("{} publishes failed", failed);
            }
        }
        self.completed.store(true, Ordering::Relaxed);
        self.set_progress(1.0);

        info!(published, failed, "Alarm recovery finished");
        published
    }

    /// Warm startup: republish `point:<id>:latest` keys from the RDB's
    /// current-values table.
    pub async fn recover_latest_point_values(
        &self,
        current_values: &dyn CurrentValueRepository,
    ) -> usize {
        let values = match current_values.latest_values().await {
            Ok(values) => values,
            Err(e) => {
                warn!(error = %e, "Could not load latest point values");
                return 0;
            }
        };

        let mut restored = 0usize;
        for point in &values {
            let blob = json!({
                "value": point.value,
                "quality": point.quality,
                "timestamp": point.timestamp.timestamp_millis(),
            });
            match self
                .writer
                .restore_latest_value(point.point_id, &blob.to_string())
                .await
            {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!(point_id = point.point_id, error = %e, "Latest value restore failed");
                }
            }
        }
        info!(restored, total = values.len(), "Latest point values recovered");
        restored
    }

    fn validate(occurrence: &AlarmOccurrence) -> bool {
        occurrence.id > 0 && occurrence.rule_id > 0
    }

    fn policy_allows(policy: &RecoveryPolicy, occurrence: &AlarmOccurrence) -> bool {
        match policy {
            RecoveryPolicy::AllActiveAlarms => true,
            RecoveryPolicy::CriticalOnly => occurrence.severity == AlarmSeverity::Critical,
            RecoveryPolicy::HighAndCritical => occurrence.severity >= AlarmSeverity::High,
            RecoveryPolicy::TenantSpecific(tenants) => tenants.contains(&occurrence.tenant_id),
            RecoveryPolicy::TimeWindow(start, end) => {
                occurrence.occurrence_time >= *start && occurrence.occurrence_time <= *end
            }
        }
    }

    async fn publish_with_retry(&self, event: &AlarmEventData) -> bool {
        for attempt in 0..self.config.retry_attempts.max(1) {
            if attempt > 0 {
                sleep(Duration::from_millis(self.config.retry_backoff_ms)).await;
            }
            match self.writer.publish_alarm_event(event).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        occurrence_id = event.occurrence_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Recovery publish failed"
                    );
                    let mut stats = self.stats.lock().unwrap_or_else(|err| err.into_inner());
                    stats.last_error = e.to_string();
                }
            }
        }
        false
    }

    fn set_progress(&self, value: f64) {
        self.progress.store(value.to_bits(), Ordering::Relaxed);
    }
}
