//! Device data messages emitted by protocol drivers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::{Quality, Value};

/// Field protocol that produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    ModbusTcp,
    ModbusRtu,
    OpcUa,
    BleBeacon,
    Mqtt,
}

/// One sampled value with its acquisition metadata.
///
/// Cheap to copy; the pipeline clones these freely between the raw and
/// enriched point lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedValue {
    pub point_id: i64,
    pub value: Value,
    #[serde(default)]
    pub quality: Quality,
    pub timestamp: DateTime<Utc>,
    /// Origin of the sample: driver name, or "virtual" for computed points.
    #[serde(default)]
    pub source: String,
    /// Whether the driver observed a change against the previous scan.
    #[serde(default)]
    pub value_changed: bool,
}

impl TimestampedValue {
    pub fn new(point_id: i64, value: impl Into<Value>) -> Self {
        Self {
            point_id,
            value: value.into(),
            quality: Quality::Good,
            timestamp: Utc::now(),
            source: String::new(),
            value_changed: true,
        }
    }
}

/// One batch of samples from a single device scan.
///
/// Immutable once emitted by a driver; the pipeline owns it transiently
/// through a [`crate::pipeline::PipelineContext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDataMessage {
    #[serde(rename = "type", default = "DeviceDataMessage::default_type")]
    pub msg_type: String,
    pub device_id: i64,
    pub tenant_id: i32,
    #[serde(default)]
    pub protocol: Protocol,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: u8,
    pub points: Vec<TimestampedValue>,
}

impl DeviceDataMessage {
    fn default_type() -> String {
        "device_data".to_string()
    }

    pub fn new(device_id: i64, tenant_id: i32, points: Vec<TimestampedValue>) -> Self {
        Self {
            msg_type: Self::default_type(),
            device_id,
            tenant_id,
            protocol: Protocol::default(),
            timestamp: Utc::now(),
            priority: 0,
            points,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_json_shape() {
        let msg = DeviceDataMessage::new(7, 1, vec![TimestampedValue::new(1, 150.0)]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "device_data");
        assert_eq!(json["device_id"], 7);
        assert_eq!(json["points"][0]["point_id"], 1);
        assert_eq!(json["points"][0]["quality"], "GOOD");
    }
}
