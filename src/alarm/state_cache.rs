//! In-memory alarm and point state
//!
//! Authoritative for "is this alarm currently active?" — the evaluator
//! never asks the database. Two maps under one reader/writer lock; reads
//! take the shared side, updates the exclusive side. The exclusive lock
//! during updates is what preserves the per-rule ordering of
//! triggered/cleared transitions across pipeline workers.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::types::Value;

/// Last observed state of a data point.
#[derive(Debug, Clone, Default)]
pub struct PointState {
    pub last_value: Value,
    pub last_digital_state: bool,
    pub last_check_time: Option<DateTime<Utc>>,
}

/// Current activation status of a rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlarmStatus {
    pub is_active: bool,
    pub occurrence_id: i64,
}

#[derive(Default)]
struct CacheInner {
    point_states: HashMap<i64, PointState>,
    alarm_statuses: HashMap<i64, AlarmStatus>,
}

/// Shared alarm/point state cache.
#[derive(Default)]
pub struct AlarmStateCache {
    inner: RwLock<CacheInner>,
}

impl AlarmStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_point_state(&self, point_id: i64, value: &Value) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let state = inner.point_states.entry(point_id).or_default();
        state.last_value = value.clone();
        state.last_digital_state = value.as_bool();
        state.last_check_time = Some(Utc::now());
    }

    pub fn point_state(&self, point_id: i64) -> PointState {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .point_states
            .get(&point_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_alarm_status(&self, rule_id: i64, active: bool, occurrence_id: i64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.alarm_statuses.insert(
            rule_id,
            AlarmStatus {
                is_active: active,
                occurrence_id,
            },
        );
    }

    pub fn alarm_status(&self, rule_id: i64) -> AlarmStatus {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .alarm_statuses
            .get(&rule_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_active(&self, rule_id: i64) -> bool {
        self.alarm_status(rule_id).is_active
    }

    /// Rule ids currently marked active.
    pub fn active_rule_ids(&self) -> Vec<i64> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .alarm_statuses
            .iter()
            .filter(|(_, s)| s.is_active)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.point_states.clear();
        inner.alarm_statuses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_rule_is_inactive() {
        let cache = AlarmStateCache::new();
        assert!(!cache.is_active(99));
        assert_eq!(cache.alarm_status(99).occurrence_id, 0);
    }

    #[test]
    fn status_round_trip() {
        let cache = AlarmStateCache::new();
        cache.set_alarm_status(10, true, 55);
        let status = cache.alarm_status(10);
        assert!(status.is_active);
        assert_eq!(status.occurrence_id, 55);

        cache.set_alarm_status(10, false, 0);
        assert!(!cache.is_active(10));
    }

    #[test]
    fn point_state_tracks_digital_interpretation() {
        let cache = AlarmStateCache::new();
        cache.update_point_state(1, &Value::Float(5.0));
        let state = cache.point_state(1);
        assert!(state.last_digital_state);
        assert_eq!(state.last_value, Value::Float(5.0));
    }
}
