//! Redis data writer
//!
//! Hot-path fan-out of processed data: latest-value keys, device
//! snapshots, alarm event publication, and the active-alarm key set.
//! All writes are best-effort — Redis being down degrades freshness, it
//! never fails the pipeline.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::config::defaults::{CHANNEL_ALARMS_PROCESSED, KEY_ALARM_ACTIVE_PREFIX};
use crate::types::{AlarmEventData, AlarmState, DeviceDataMessage};

use super::redis_sink::{RedisError, RedisSink};

pub struct RedisDataWriter {
    sink: Arc<dyn RedisSink>,
}

impl RedisDataWriter {
    pub fn new(sink: Arc<dyn RedisSink>) -> Self {
        Self { sink }
    }

    pub fn latest_key(point_id: i64) -> String {
        format!("point:{}:latest", point_id)
    }

    pub fn device_key(device_id: i64) -> String {
        format!("device:full:{}", device_id)
    }

    pub fn active_alarm_key(rule_id: i64) -> String {
        format!("{}{}", KEY_ALARM_ACTIVE_PREFIX, rule_id)
    }

    /// Write `point:<id>:latest` blobs for every point plus the
    /// `device:full:<id>` summary. Returns how many points were saved;
    /// 0 with a warning when Redis is unreachable.
    pub async fn save_device_message(&self, message: &DeviceDataMessage) -> usize {
        let mut saved = 0usize;
        for point in &message.points {
            let blob = json!({
                "value": point.value,
                "quality": point.quality,
                "timestamp": point.timestamp.timestamp_millis(),
            });
            match self
                .sink
                .set(&Self::latest_key(point.point_id), &blob.to_string())
                .await
            {
                Ok(()) => saved += 1,
                Err(e) => {
                    warn!(point_id = point.point_id, error = %e, "Latest-value write failed");
                    return saved;
                }
            }
        }

        let snapshot = json!({
            "device_id": message.device_id,
            "tenant_id": message.tenant_id,
            "timestamp": message.timestamp.timestamp_millis(),
            "point_count": message.points.len(),
            "points": message.points.iter().map(|p| json!({
                "point_id": p.point_id,
                "value": p.value,
                "quality": p.quality,
            })).collect::<Vec<_>>(),
        });
        if let Err(e) = self
            .sink
            .set(&Self::device_key(message.device_id), &snapshot.to_string())
            .await
        {
            warn!(device_id = message.device_id, error = %e, "Device snapshot write failed");
        }

        debug!(
            device_id = message.device_id,
            points = saved,
            "Device message saved to Redis"
        );
        saved
    }

    /// Publish one alarm event and maintain the `alarm:active:<rule_id>`
    /// key: set on ACTIVE, deleted on CLEARED, both before the publish so
    /// subscribers reacting to the event see consistent key state.
    pub async fn publish_alarm_event(&self, event: &AlarmEventData) -> Result<(), RedisError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| RedisError::Command(format!("serialize alarm event: {}", e)))?;

        let key = Self::active_alarm_key(event.rule_id);
        match event.state {
            AlarmState::Active => self.sink.set(&key, &payload).await?,
            AlarmState::Cleared => self.sink.del(&key).await?,
            _ => {}
        }

        self.sink.publish(CHANNEL_ALARMS_PROCESSED, &payload).await?;
        debug!(
            rule_id = event.rule_id,
            occurrence_id = event.occurrence_id,
            state = ?event.state,
            "Alarm event published"
        );
        Ok(())
    }

    /// Republish a single `point:<id>:latest` key (warm startup recovery).
    pub async fn restore_latest_value(
        &self,
        point_id: i64,
        payload: &str,
    ) -> Result<(), RedisError> {
        self.sink.set(&Self::latest_key(point_id), payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySink;
    use crate::types::{AlarmSeverity, TimestampedValue};

    fn make_event(rule_id: i64, state: AlarmState) -> AlarmEventData {
        AlarmEventData {
            event_type: AlarmEventData::EVENT_TYPE.to_string(),
            occurrence_id: 1,
            rule_id,
            tenant_id: 1,
            device_id: Some(7),
            point_id: Some(1),
            message: "test".to_string(),
            severity: AlarmSeverity::Critical,
            state,
            timestamp: 0,
            source_name: "p1".to_string(),
            location: String::new(),
            trigger_value: "150".to_string(),
        }
    }

    #[tokio::test]
    async fn saves_latest_and_snapshot_keys() {
        let sink = Arc::new(MemorySink::new());
        let writer = RedisDataWriter::new(Arc::clone(&sink) as Arc<dyn RedisSink>);

        let msg = DeviceDataMessage::new(7, 1, vec![TimestampedValue::new(1, 150.0)]);
        assert_eq!(writer.save_device_message(&msg).await, 1);

        let blob: serde_json::Value =
            serde_json::from_str(&sink.key("point:1:latest").unwrap()).unwrap();
        assert_eq!(blob["value"], 150.0);
        assert_eq!(blob["quality"], "GOOD");
        assert!(sink.key("device:full:7").is_some());
    }

    #[tokio::test]
    async fn active_alarm_key_lifecycle() {
        let sink = Arc::new(MemorySink::new());
        let writer = RedisDataWriter::new(Arc::clone(&sink) as Arc<dyn RedisSink>);

        writer
            .publish_alarm_event(&make_event(10, AlarmState::Active))
            .await
            .unwrap();
        assert!(sink.key("alarm:active:10").is_some());
        assert_eq!(sink.published_on(CHANNEL_ALARMS_PROCESSED).len(), 1);

        writer
            .publish_alarm_event(&make_event(10, AlarmState::Cleared))
            .await
            .unwrap();
        assert!(sink.key("alarm:active:10").is_none());
        assert_eq!(sink.published_on(CHANNEL_ALARMS_PROCESSED).len(), 2);
    }

    #[tokio::test]
    async fn outage_reports_zero_saved() {
        let sink = Arc::new(MemorySink::new());
        sink.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        let writer = RedisDataWriter::new(Arc::clone(&sink) as Arc<dyn RedisSink>);

        let msg = DeviceDataMessage::new(7, 1, vec![TimestampedValue::new(1, 150.0)]);
        assert_eq!(writer.save_device_message(&msg).await, 0);
    }
}
