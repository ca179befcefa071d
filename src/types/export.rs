//! Export gateway types: dynamic targets, CSP wire messages, send results
//!
//! `CspAlarmMessage` keeps the legacy external JSON layout byte-compatible:
//! `{bd, nm, vl, tm, al, st, des}` with `tm` formatted
//! `yyyy-MM-dd HH:mm:ss.fff`. The `point_id`/`site_id` fields are routing
//! metadata carried in-process only and never serialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::alarm::{AlarmEventData, AlarmState};

/// Kind of external sink a target exports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetType {
    Http,
    S3,
    File,
    Mqtt,
}

impl TargetType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::S3 => "S3",
            Self::File => "FILE",
            Self::Mqtt => "MQTT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => Some(Self::Http),
            "S3" => Some(Self::S3),
            "FILE" => Some(Self::File),
            "MQTT" => Some(Self::Mqtt),
            _ => None,
        }
    }
}

/// Runtime-assembled export destination: type + config bag + ordering.
///
/// `config` is the per-type option bag; handlers validate the keys they
/// understand and reject the target on errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicTarget {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub enabled: bool,
    #[serde(default)]
    pub execution_order: i32,
    #[serde(default)]
    pub execution_delay_ms: u64,
    #[serde(default)]
    pub priority: i32,
    pub config: serde_json::Value,
    #[serde(default)]
    pub description: String,
}

/// Legacy CSP alarm payload. Field names are the external contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CspAlarmMessage {
    /// Building ID
    pub bd: i32,
    /// Point name
    pub nm: String,
    /// Trigger value
    pub vl: f64,
    /// Timestamp, `yyyy-MM-dd HH:mm:ss.fff`
    pub tm: String,
    /// 1 = alarm set, 0 = alarm cleared
    pub al: i32,
    /// Occurrence state ordinal (pass-through)
    pub st: i32,
    /// Description
    pub des: String,

    /// Source point id — in-process routing only, never serialized.
    #[serde(skip)]
    pub point_id: i64,
    /// Source site id — in-process routing only, never serialized.
    #[serde(skip)]
    pub site_id: i32,
}

impl CspAlarmMessage {
    /// Format a timestamp the way the legacy C# consumer expects.
    pub fn format_time(time: DateTime<Utc>) -> String {
        time.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }

    /// Convert a backend alarm event into the CSP shape.
    ///
    /// `al` reflects active/clear; `st` passes the state ordinal through
    /// so acknowledgement remains visible downstream.
    pub fn from_event_data(data: &AlarmEventData, building_id: i32) -> Self {
        let time = DateTime::<Utc>::from_timestamp_millis(data.timestamp).unwrap_or_else(Utc::now);
        Self {
            bd: building_id,
            nm: data.source_name.clone(),
            vl: data.trigger_value.trim().parse().unwrap_or(0.0),
            tm: Self::format_time(time),
            al: if data.state == AlarmState::Active { 1 } else { 0 },
            st: data.state.as_ordinal(),
            des: data.message.clone(),
            point_id: data.point_id.unwrap_or(0),
            site_id: building_id,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.bd > 0 && !self.nm.is_empty() && !self.tm.is_empty() && (self.al == 0 || self.al == 1)
    }

    /// Sample message for handler tests and connection probes.
    pub fn sample(building_id: i32, point_name: &str, trigger_value: f64, active: bool) -> Self {
        Self {
            bd: building_id,
            nm: point_name.to_string(),
            vl: trigger_value,
            tm: Self::format_time(Utc::now()),
            al: if active { 1 } else { 0 },
            st: if active {
                AlarmState::Active.as_ordinal()
            } else {
                AlarmState::Cleared.as_ordinal()
            },
            des: format!("{} alarm {}", point_name, if active { "set" } else { "clear" }),
            point_id: 0,
            site_id: building_id,
        }
    }
}

/// Legacy CSP sampled-value payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CspValueMessage {
    pub bd: i32,
    pub nm: String,
    pub vl: f64,
    pub tm: String,

    #[serde(skip)]
    pub point_id: i64,
    #[serde(skip)]
    pub site_id: i32,
}

/// Outcome of one handler send. Field set is shared by every handler type;
/// type-specific fields stay at their defaults when not applicable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSendResult {
    pub success: bool,
    pub skipped: bool,
    pub error_message: String,
    pub response_time_ms: u64,
    pub content_size: usize,
    pub retry_count: u32,

    pub target_id: i64,
    pub target_name: String,
    pub target_type: String,
    pub sent_payload: String,

    pub status_code: u16,
    pub response_body: String,

    pub file_path: String,
    pub s3_object_key: String,
    pub mqtt_topic: String,

    pub timestamp: DateTime<Utc>,
}

impl Default for TargetSendResult {
    fn default() -> Self {
        Self {
            success: false,
            skipped: false,
            error_message: String::new(),
            response_time_ms: 0,
            content_size: 0,
            retry_count: 0,
            target_id: 0,
            target_name: String::new(),
            target_type: String::new(),
            sent_payload: String::new(),
            status_code: 0,
            response_body: String::new(),
            file_path: String::new(),
            s3_object_key: String::new(),
            mqtt_topic: String::new(),
            timestamp: Utc::now(),
        }
    }
}

impl TargetSendResult {
    pub fn failure(target_name: &str, error: impl Into<String>) -> Self {
        Self {
            target_name: target_name.to_string(),
            error_message: error.into(),
            ..Self::default()
        }
    }

    pub fn is_http_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Aggregate result of a batch send across targets.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchTargetResult {
    pub total_targets: usize,
    pub successful_targets: usize,
    pub failed_targets: usize,
    pub results: Vec<TargetSendResult>,
}

impl BatchTargetResult {
    pub fn push(&mut self, result: TargetSendResult) {
        if result.success {
            self.successful_targets += 1;
        } else {
            self.failed_targets += 1;
        }
        self.total_targets += 1;
        self.results.push(result);
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_targets == 0 {
            return 0.0;
        }
        self.successful_targets as f64 / self.total_targets as f64 * 100.0
    }
}
