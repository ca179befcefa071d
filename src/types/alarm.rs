//! Alarm rules, occurrences, events, and the backend wire format
//!
//! Severity and state ordinals are wire-stable: `AlarmSeverity` maps to
//! 0..4 and `AlarmState` to 0..3. JSON carries the string names; the
//! `as_ordinal`/`from_ordinal` pair covers the integer contract used by
//! legacy backend subscribers. Both forms round-trip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::Value;

/// Alarm severity, ordered. Ordinals 0..4 are part of the wire contract.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum AlarmSeverity {
    #[default]
    Info = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl AlarmSeverity {
    pub fn as_ordinal(self) -> i32 {
        self as i32
    }

    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Info),
            1 => Some(Self::Low),
            2 => Some(Self::Medium),
            3 => Some(Self::High),
            4 => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Lifecycle state of an alarm occurrence. Ordinals 0..3 are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum AlarmState {
    #[default]
    Inactive = 0,
    Active = 1,
    Acknowledged = 2,
    Cleared = 3,
}

impl AlarmState {
    pub fn as_ordinal(self) -> i32 {
        self as i32
    }

    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Inactive),
            1 => Some(Self::Active),
            2 => Some(Self::Acknowledged),
            3 => Some(Self::Cleared),
            _ => None,
        }
    }
}

/// What an alarm rule is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlarmTargetType {
    #[default]
    DataPoint,
    VirtualPoint,
    Group,
}

/// Evaluation strategy of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmType {
    #[default]
    Analog,
    Digital,
    Script,
}

/// Static alarm condition definition owned by a tenant.
///
/// Analog limits, when present, must satisfy `low_low ≤ low < high ≤ high_high`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmRule {
    pub id: i64,
    pub tenant_id: i32,
    #[serde(default)]
    pub target_type: AlarmTargetType,
    pub target_id: Option<i64>,
    #[serde(default)]
    pub alarm_type: AlarmType,
    pub high_high: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub low_low: Option<f64>,
    /// Condition formula; SCRIPT rules only.
    pub condition_script: Option<String>,
    #[serde(default)]
    pub severity: AlarmSeverity,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl AlarmRule {
    /// Check the analog limit ordering invariant over whichever limits are set.
    pub fn limits_ordered(&self) -> bool {
        let pairs = [
            (self.low_low, self.low),
            (self.low, self.high),
            (self.high, self.high_high),
        ];
        pairs.iter().all(|(lo, hi)| match (lo, hi) {
            (Some(lo), Some(hi)) => lo <= hi,
            _ => true,
        })
    }
}

/// Which analog limit fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionMet {
    #[default]
    None,
    HighHigh,
    High,
    Low,
    LowLow,
}

/// A realized transition of a rule into or out of the active state,
/// as persisted in the RDB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmOccurrence {
    pub id: i64,
    pub rule_id: i64,
    pub tenant_id: i32,
    pub point_id: Option<i64>,
    pub device_id: Option<i64>,
    pub state: AlarmState,
    pub severity: AlarmSeverity,
    pub trigger_value: String,
    pub message: String,
    pub occurrence_time: DateTime<Utc>,
    pub acknowledged_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub location: String,
}

/// In-process alarm transition event produced by the alarm stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub occurrence_id: i64,
    pub rule_id: i64,
    pub tenant_id: i32,
    pub point_id: Option<i64>,
    pub device_id: Option<i64>,
    pub state: AlarmState,
    pub severity: AlarmSeverity,
    pub condition_met: ConditionMet,
    pub message: String,
    pub trigger_value: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub location: String,
}

/// Backend wire envelope published on `alarms:processed`.
///
/// Field names and types are a fixed contract with backend subscribers —
/// do not rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEventData {
    #[serde(rename = "type")]
    pub event_type: String,
    pub occurrence_id: i64,
    pub rule_id: i64,
    pub tenant_id: i32,
    pub device_id: Option<i64>,
    pub point_id: Option<i64>,
    pub message: String,
    pub severity: AlarmSeverity,
    pub state: AlarmState,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub source_name: String,
    pub location: String,
    pub trigger_value: String,
}

impl AlarmEventData {
    pub const EVENT_TYPE: &'static str = "alarm_event";

    pub fn from_event(event: &AlarmEvent) -> Self {
        Self {
            event_type: Self::EVENT_TYPE.to_string(),
            occurrence_id: event.occurrence_id,
            rule_id: event.rule_id,
            tenant_id: event.tenant_id,
            device_id: event.device_id,
            point_id: event.point_id,
            message: event.message.clone(),
            severity: event.severity,
            state: event.state,
            timestamp: event.timestamp.timestamp_millis(),
            source_name: event.source_name.clone(),
            location: event.location.clone(),
            trigger_value: event.trigger_value.to_string(),
        }
    }

    pub fn from_occurrence(occurrence: &AlarmOccurrence) -> Self {
        Self {
            event_type: Self::EVENT_TYPE.to_string(),
            occurrence_id: occurrence.id,
            rule_id: occurrence.rule_id,
            tenant_id: occurrence.tenant_id,
            device_id: occurrence.device_id,
            point_id: occurrence.point_id,
            message: occurrence.message.clone(),
            severity: occurrence.severity,
            state: occurrence.state,
            timestamp: occurrence.occurrence_time.timestamp_millis(),
            source_name: occurrence.source_name.clone(),
            location: occurrence.location.clone(),
            trigger_value: occurrence.trigger_value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordinals_are_stable() {
        assert_eq!(AlarmSeverity::Info.as_ordinal(), 0);
        assert_eq!(AlarmSeverity::Critical.as_ordinal(), 4);
        for ord in 0..=4 {
            let sev = AlarmSeverity::from_ordinal(ord).unwrap();
            assert_eq!(sev.as_ordinal(), ord);
        }
        assert!(AlarmSeverity::from_ordinal(5).is_none());
    }

    #[test]
    fn state_ordinals_are_stable() {
        assert_eq!(AlarmState::Inactive.as_ordinal(), 0);
        assert_eq!(AlarmState::Cleared.as_ordinal(), 3);
        for ord in 0..=3 {
            let state = AlarmState::from_ordinal(ord).unwrap();
            assert_eq!(state.as_ordinal(), ord);
        }
    }

    #[test]
    fn severity_string_round_trip() {
        let json = serde_json::to_string(&AlarmSeverity::Critical).unwrap();
        assert_eq!(json, "\"CRITICAL\"");
        let back: AlarmSeverity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AlarmSeverity::Critical);
    }

    #[test]
    fn event_data_wire_shape() {
        let data = AlarmEventData {
            event_type: AlarmEventData::EVENT_TYPE.to_string(),
            occurrence_id: 55,
            rule_id: 10,
            tenant_id: 1,
            device_id: Some(7),
            point_id: Some(1),
            message: "High limit exceeded".to_string(),
            severity: AlarmSeverity::Critical,
            state: AlarmState::Active,
            timestamp: 1_705_564_800_000,
            source_name: "boiler_temp".to_string(),
            location: "plant-a".to_string(),
            trigger_value: "150".to_string(),
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["type"], "alarm_event");
        assert_eq!(json["severity"], "CRITICAL");
        assert_eq!(json["state"], "ACTIVE");
        assert_eq!(json["occurrence_id"], 55);

        let back: AlarmEventData = serde_json::from_value(json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn limit_ordering_invariant() {
        let mut rule = AlarmRule {
            id: 1,
            tenant_id: 1,
            target_type: AlarmTargetType::DataPoint,
            target_id: Some(1),
            alarm_type: AlarmType::Analog,
            high_high: Some(120.0),
            high: Some(100.0),
            low: Some(10.0),
            low_low: Some(5.0),
            condition_script: None,
            severity: AlarmSeverity::High,
            enabled: true,
        };
        assert!(rule.limits_ordered());
        rule.low = Some(150.0);
        assert!(!rule.limits_ordered());
    }
}
