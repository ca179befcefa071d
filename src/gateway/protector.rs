//! Failure protector — per-target circuit breaker
//!
//! Three states: Closed admits everything, Open rejects everything until
//! the recovery timeout passes, HalfOpen admits a bounded probe budget.
//! Opening requires the full consecutive-failure threshold; any failure
//! while half-open reopens immediately. Counters are atomics; transitions
//! hold the state mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{info, warn};

use crate::config::defaults::{
    PROTECTOR_FAILURE_THRESHOLD, PROTECTOR_HALF_OPEN_REQUESTS, PROTECTOR_RECENT_FAILURES,
    PROTECTOR_RECOVERY_TIMEOUT_MS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectorState {
    Closed,
    Open,
    HalfOpen,
}

impl ProtectorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProtectorConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_requests: u32,
    pub max_consecutive_failures: u32,
}

impl Default for ProtectorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: PROTECTOR_FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_millis(PROTECTOR_RECOVERY_TIMEOUT_MS),
            half_open_requests: PROTECTOR_HALF_OPEN_REQUESTS,
            max_consecutive_failures: PROTECTOR_FAILURE_THRESHOLD * 2,
        }
    }
}

impl ProtectorConfig {
    /// Read overrides from a target's config bag.
    pub fn from_target_config(config: &serde_json::Value) -> Self {
        let mut out = Self::default();
        if let Some(v) = config.get("failure_threshold").and_then(|v| v.as_u64()) {
            out.failure_threshold = v.max(1) as u32;
            out.max_consecutive_failures = out.failure_threshold * 2;
        }
        if let Some(v) = config.get("recovery_timeout_ms").and_then(|v| v.as_u64()) {
            out.recovery_timeout = Duration::from_millis(v);
        }
        if let Some(v) = config.get("half_open_requests").and_then(|v| v.as_u64()) {
            out.half_open_requests = v.max(1) as u32;
        }
        out
    }
}

/// Statistics snapshot for admin surfaces.
#[derive(Debug, Clone)]
pub struct ProtectorStats {
    pub state: ProtectorState,
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub time_until_recovery: Duration,
    pub failure_rate: f64,
}

impl ProtectorStats {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "state": self.state.as_str(),
            "total_requests": self.total_requests,
            "rejected_requests": self.rejected_requests,
            "total_successes": self.total_successes,
            "total_failures": self.total_failures,
            "consecutive_failures": self.consecutive_failures,
            "time_until_recovery_ms": self.time_until_recovery.as_millis() as u64,
            "failure_rate": self.failure_rate,
        })
    }
}

struct Inner {
    state: ProtectorState,
    consecutive_failures: u32,
    half_open_attempts: u32,
    half_open_successes: u32,
    state_change: Instant,
    last_failure: Option<Instant>,
    /// Recent `(when, success)` outcomes for windowed rate queries.
    recent: VecDeque<(Instant, bool)>,
}

pub struct FailureProtector {
    name: String,
    config: Mutex<ProtectorConfig>,
    inner: Mutex<Inner>,
    total_requests: AtomicU64,
    rejected_requests: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
}

impl FailureProtector {
    pub fn new(name: impl Into<String>, config: ProtectorConfig) -> Self {
        Self {
            name: name.into(),
            config: Mutex::new(config),
            inner: Mutex::new(Inner {
                state: ProtectorState::Closed,
                consecutive_failures: 0,
                half_open_attempts: 0,
                half_open_successes: 0,
                state_change: Instant::now(),
                last_failure: None,
                recent: VecDeque::with_capacity(PROTECTOR_RECENT_FAILURES),
            }),
            total_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admission check. Open transitions to HalfOpen once the recovery
    /// timeout has passed; HalfOpen admits at most the probe budget.
    pub fn can_execute(&self) -> bool {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        match inner.state {
            ProtectorState::Closed => true,
            ProtectorState::Open => {
                if inner.state_change.elapsed() >= config.recovery_timeout {
                    info!(protector = %self.name, "Recovery timeout reached — probing (HALF_OPEN)");
                    inner.state = ProtectorState::HalfOpen;
                    inner.state_change = Instant::now();
                    inner.half_open_attempts = 1;
                    inner.half_open_successes = 0;
                    true
                } else {
                    self.rejected_requests.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
            ProtectorState::HalfOpen => {
                if inner.half_open_attempts < config.half_open_requests {
                    inner.half_open_attempts += 1;
                    true
                } else {
                    self.rejected_requests.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        push_recent(&mut inner.recent, true);

        match inner.state {
            ProtectorState::Closed => inner.consecutive_failures = 0,
            ProtectorState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= config.half_open_requests {
                    info!(protector = %self.name, "Probes succeeded — closing");
                    inner.state = ProtectorState::Closed;
                    inner.state_change = Instant::now();
                    inner.consecutive_failures = 0;
                    inner.half_open_attempts = 0;
                    inner.half_open_successes = 0;
                }
            }
            ProtectorState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        push_recent(&mut inner.recent, false);

        match inner.state {
            ProtectorState::Closed => {
                if inner.consecutive_failures >= config.failure_threshold {
                    warn!(
                        protector = %self.name,
                        consecutive = inner.consecutive_failures,
                        "Failure threshold reached — opening"
                    );
                    inner.state = ProtectorState::Open;
                    inner.state_change = Instant::now();
                }
            }
            ProtectorState::HalfOpen => {
                warn!(protector = %self.name, "Probe failed — reopening");
                inner.state = ProtectorState::Open;
                inner.state_change = Instant::now();
                inner.half_open_attempts = 0;
                inner.half_open_successes = 0;
            }
            ProtectorState::Open => {}
        }
    }

    pub fn state(&self) -> ProtectorState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ProtectorState::Open
    }

    /// Admin override: back to Closed with counters cleared.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = ProtectorState::Closed;
        inner.state_change = Instant::now();
        inner.consecutive_failures = 0;
        inner.half_open_attempts = 0;
        inner.half_open_successes = 0;
        inner.recent.clear();
        info!(protector = %self.name, "Protector reset");
    }

    /// Test/admin override: force Open regardless of counters.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = ProtectorState::Open;
        inner.state_change = Instant::now();
    }

    /// Failure fraction of recent outcomes inside the window; 0.0 when idle.
    pub fn failure_rate(&self, window: Duration) -> f64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut failures = 0usize;
        let mut total = 0usize;
        for (when, success) in &inner.recent {
            if when.elapsed() <= window {
                total += 1;
                if !success {
                    failures += 1;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        }
    }

    /// Time left until an Open protector starts probing; zero otherwise.
    pub fn time_until_recovery(&self) -> Duration {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state != ProtectorState::Open {
            return Duration::ZERO;
        }
        config
            .recovery_timeout
            .saturating_sub(inner.state_change.elapsed())
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == ProtectorState::Closed
            && self.failure_rate(Duration::from_secs(300)) < 0.5
    }

    /// Runtime reconfiguration.
    pub fn update_configuration(
        &self,
        failure_threshold: u32,
        recovery_timeout: Duration,
        half_open_requests: u32,
    ) {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        config.failure_threshold = failure_threshold.max(1);
        config.recovery_timeout = recovery_timeout;
        config.half_open_requests = half_open_requests.max(1);
        config.max_consecutive_failures = config.failure_threshold * 2;
    }

    pub fn statistics(&self) -> ProtectorStats {
        let consecutive = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.consecutive_failures
        };
        ProtectorStats {
            state: self.state(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            consecutive_failures: consecutive,
            time_until_recovery: self.time_until_recovery(),
            failure_rate: self.failure_rate(Duration::from_secs(300)),
        }
    }
}

fn push_recent(recent: &mut VecDeque<(Instant, bool)>, success: bool) {
    if recent.len() >= PROTECTOR_RECENT_FAILURES {
        recent.pop_front();
    }
    recent.push_back((Instant::now(), success));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_protector(threshold: u32, timeout_ms: u64, half_open: u32) -> FailureProtector {
        FailureProtector::new(
            "test",
            ProtectorConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(timeout_ms),
                half_open_requests: half_open,
                max_consecutive_failures: threshold * 2,
            },
        )
    }

    #[test]
    fn opens_exactly_at_threshold() {
        let p = make_protector(3, 60_000, 2);
        p.record_failure();
        p.record_failure();
        assert_eq!(p.state(), ProtectorState::Closed); // threshold - 1
        p.record_failure();
        assert_eq!(p.state(), ProtectorState::Open);
        assert!(!p.can_execute());
    }

    #[test]
    fn success_resets_consecutive_count() {
        let p = make_protector(3, 60_000, 2);
        p.record_failure();
        p.record_failure();
        p.record_success();
        p.record_failure();
        p.record_failure();
        assert_eq!(p.state(), ProtectorState::Closed);
    }

    #[test]
    fn recovers_through_half_open() {
        let p = make_protector(3, 30, 2);
        for _ in 0..3 {
            p.record_failure();
        }
        assert_eq!(p.state(), ProtectorState::Open);
        assert!(!p.can_execute());

        std::thread::sleep(Duration::from_millis(40));

        // First probe admitted, transitions to HalfOpen
        assert!(p.can_execute());
        assert_eq!(p.state(), ProtectorState::HalfOpen);
        p.record_success();
        assert!(p.can_execute());
        p.record_success();
        assert_eq!(p.state(), ProtectorState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let p = make_protector(2, 30, 3);
        p.record_failure();
        p.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert!(p.can_execute());
        p.record_failure();
        assert_eq!(p.state(), ProtectorState::Open);
    }

    #[test]
    fn half_open_admits_probe_budget_only() {
        let p = make_protector(1, 30, 2);
        p.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert!(p.can_execute()); // probe 1 (transition)
        assert!(p.can_execute()); // probe 2
        assert!(!p.can_execute()); // budget exhausted
    }

    #[test]
    fn reset_and_force_open() {
        let p = make_protector(1, 60_000, 1);
        p.record_failure();
        assert!(p.is_open());
        p.reset();
        assert_eq!(p.state(), ProtectorState::Closed);
        p.force_open();
        assert!(p.is_open());
    }

    #[test]
    fn failure_rate_over_window() {
        let p = make_protector(10, 60_000, 1);
        p.record_failure();
        p.record_success();
        p.record_failure();
        p.record_failure();
        let rate = p.failure_rate(Duration::from_secs(60));
        assert!((rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn config_from_target_bag() {
        let config = serde_json::json!({
            "failure_threshold": 3,
            "recovery_timeout_ms": 5000,
            "half_open_requests": 2,
        });
        let parsed = ProtectorConfig::from_target_config(&config);
        assert_eq!(parsed.failure_threshold, 3);
        assert_eq!(parsed.recovery_timeout, Duration::from_millis(5000));
        assert_eq!(parsed.half_open_requests, 2);
        assert_eq!(parsed.max_consecutive_failures, 6);
    }
}
