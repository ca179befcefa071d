//! MQTT target handler
//!
//! Publishes alarms to a broker over `rumqttc`. The event loop runs as a
//! background task that tracks connection state and, with auto-reconnect
//! on, keeps polling through broker outages. Publishes attempted while
//! disconnected are buffered up to `max_queue_size` (drop-oldest) and
//! flushed after the next CONNACK.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gateway::template::{expand, TemplateVars};
use crate::types::{CspAlarmMessage, CspValueMessage, TargetSendResult};

use super::{HandlerError, TargetHandler};

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_QUEUE_SIZE: usize = 1000;
const DEFAULT_TOPIC_PATTERN: &str = "alarms/{building_id}/{point_name}";

#[derive(Debug, Clone)]
struct QueuedPublish {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
}

struct Connection {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    pending: Arc<Mutex<VecDeque<QueuedPublish>>>,
    event_loop: JoinHandle<()>,
    max_queue_size: usize,
}

pub struct MqttTargetHandler {
    connection: tokio::sync::Mutex<Option<Connection>>,
    publish_count: AtomicU64,
    success_count: AtomicU64,
    queued_count: AtomicU64,
}

impl MqttTargetHandler {
    pub fn new() -> Self {
        Self {
            connection: tokio::sync::Mutex::new(None),
            publish_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            queued_count: AtomicU64::new(0),
        }
    }

    fn qos_from(config: &serde_json::Value) -> QoS {
        match config.get("qos").and_then(|v| v.as_u64()).unwrap_or(0) {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }

    /// Topic for an alarm, from `topic_pattern` with template expansion.
    pub fn topic_for(alarm: &CspAlarmMessage, config: &serde_json::Value) -> String {
        let pattern = config
            .get("topic_pattern")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_TOPIC_PATTERN);
        expand(pattern, &TemplateVars::from_alarm(alarm))
    }

    /// Message body per `message_format` (json or text), with optional
    /// gateway metadata.
    pub fn payload_for(alarm: &CspAlarmMessage, config: &serde_json::Value) -> Vec<u8> {
        let format = config
            .get("message_format")
            .and_then(|v| v.as_str())
            .unwrap_or("json");
        if format == "text" {
            return format!(
                "{} {} {} {} {}",
                alarm.tm, alarm.bd, alarm.nm, alarm.vl, alarm.al
            )
            .into_bytes();
        }

        let include_metadata = config
            .get("include_metadata")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !include_metadata && config.get("additional_fields").is_none() {
            return serde_json::to_vec(alarm).unwrap_or_default();
        }

        let mut body = serde_json::to_value(alarm).unwrap_or_default();
        if let Some(object) = body.as_object_mut() {
            if include_metadata {
                object.insert("exported_by".to_string(), json!("pulseone-gateway"));
                object.insert(
                    "exported_at".to_string(),
                    json!(chrono::Utc::now().timestamp_millis()),
                );
            }
            if let Some(extra) = config.get("additional_fields").and_then(|v| v.as_object()) {
                for (name, value) in extra {
                    object.insert(name.clone(), value.clone());
                }
            }
        }
        serde_json::to_vec(&body).unwrap_or_default()
    }

    async fn connect(&self, config: &serde_json::Value) -> Result<(), HandlerError> {
        let host = config
            .get("broker_host")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::InvalidConfig("broker_host is required".to_string()))?;
        let port = config
            .get("broker_port")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_PORT as u64) as u16;
        let client_id = config
            .get("client_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("pulseone-{}", uuid::Uuid::new_v4()));

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (
            config.get("username").and_then(|v| v.as_str()),
            config.get("password").and_then(|v| v.as_str()),
        ) {
            options.set_credentials(user, pass);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let connected = Arc::new(AtomicBool::new(false));
        let pending: Arc<Mutex<VecDeque<QueuedPublish>>> = Arc::new(Mutex::new(VecDeque::new()));

        let auto_reconnect = config
            .get("auto_reconnect")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let reconnect_interval = Duration::from_secs(
            config
                .get("reconnect_interval_sec")
                .and_then(|v| v.as_u64())
                .unwrap_or(5),
        );
        let max_attempts = config
            .get("max_reconnect_attempts")
            .and_then(|v| v.as_u64())
            .unwrap_or(0); // 0 = unlimited

        let loop_connected = Arc::clone(&connected);
        let loop_pending = Arc::clone(&pending);
        let loop_client = client.clone();
        let event_loop = tokio::spawn(async move {
            let mut attempts = 0u64;
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                        attempts = 0;
                        loop_connected.store(true, Ordering::Release);
                        flush_pending(&loop_client, &loop_pending).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        loop_connected.store(false, Ordering::Release);
                        attempts += 1;
                        if !auto_reconnect || (max_attempts > 0 && attempts > max_attempts) {
                            warn!(error = %e, attempts, "MQTT event loop stopping");
                            break;
                        }
                        debug!(error = %e, attempts, "MQTT connection lost — retrying");
                        tokio::time::sleep(reconnect_interval).await;
                    }
                }
            }
        });

        let max_queue_size = config
            .get("max_queue_size")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_QUEUE_SIZE as u64) as usize;

        *self.connection.lock().await = Some(Connection {
            client,
            connected,
            pending,
            event_loop,
            max_queue_size,
        });
        Ok(())
    }

    async fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        config: &serde_json::Value,
    ) -> TargetSendResult {
        let start = Instant::now();
        let mut result = TargetSendResult {
            target_type: "MQTT".to_string(),
            mqtt_topic: topic.clone(),
            content_size: payload.len(),
            ..TargetSendResult::default()
        };
        self.publish_count.fetch_add(1, Ordering::Relaxed);

        let mut connection = self.connection.lock().await;
        if connection.is_none() {
            let auto_connect = config
                .get("auto_connect")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            if !auto_connect {
                result.error_message = "MQTT handler not connected".to_string();
                return result;
            }
            drop(connection);
            if let Err(e) = self.connect(config).await {
                result.error_message = e.to_string();
                return result;
            }
            connection = self.connection.lock().await;
        }
        let Some(ref conn) = *connection else {
            result.error_message = "MQTT handler not connected".to_string();
            return result;
        };

        let qos = Self::qos_from(config);
        let retain = config
            .get("retain")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if conn.connected.load(Ordering::Acquire) {
            match conn.client.publish(topic.as_str(), qos, retain, payload).await {
                Ok(()) => {
                    result.success = true;
                    self.success_count.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => result.error_message = format!("MQTT publish failed: {}", e),
            }
        } else {
            // Broker away: buffer for the reconnect flush. The send is
            // reported as accepted so the runner does not trip the breaker
            // over a transient broker restart.
            let mut pending = conn.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.len() >= conn.max_queue_size {
                pending.pop_front();
            }
            pending.push_back(QueuedPublish {
                topic,
                payload,
                qos,
                retain,
            });
            self.queued_count.fetch_add(1, Ordering::Relaxed);
            result.success = true;
            result.response_body = "queued (broker disconnected)".to_string();
        }

        result.response_time_ms = start.elapsed().as_millis() as u64;
        result
    }

    /// Buffered publishes waiting for a reconnect.
    pub async fn queue_size(&self) -> usize {
        match &*self.connection.lock().await {
            Some(conn) => conn.pending.lock().unwrap_or_else(|e| e.into_inner()).len(),
            None => 0,
        }
    }
}

async fn flush_pending(client: &AsyncClient, pending: &Arc<Mutex<VecDeque<QueuedPublish>>>) {
    loop {
        let next = {
            let mut queue = pending.lock().unwrap_or_else(|e| e.into_inner());
            queue.pop_front()
        };
        let Some(message) = next else { break };
        if let Err(e) = client
            .publish(
                message.topic.as_str(),
                message.qos,
                message.retain,
                message.payload.clone(),
            )
            .await
        {
            warn!(topic = %message.topic, error = %e, "Queued publish flush failed");
            break;
        }
    }
}

impl Default for MqttTargetHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetHandler for MqttTargetHandler {
    fn handler_type(&self) -> &'static str {
        "MQTT"
    }

    async fn initialize(&self, config: &serde_json::Value) -> Result<(), HandlerError> {
        let auto_connect = config
            .get("auto_connect")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if auto_connect {
            self.connect(config).await?;
        }
        Ok(())
    }

    async fn send_alarm(
        &self,
        alarm: &CspAlarmMessage,
        config: &serde_json::Value,
    ) -> TargetSendResult {
        let topic = Self::topic_for(alarm, config);
        let payload = Self::payload_for(alarm, config);
        self.publish(topic, payload, config).await
    }

    async fn send_value(
        &self,
        value: &CspValueMessage,
        config: &serde_json::Value,
    ) -> TargetSendResult {
        let vars = TemplateVars {
            building_id: value.bd,
            point_name: value.nm.clone(),
            value: value.vl,
            time: chrono::Utc::now(),
        };
        let pattern = config
            .get("topic_pattern")
            .and_then(|v| v.as_str())
            .unwrap_or("values/{building_id}/{point_name}");
        let topic = expand(pattern, &vars);
        let payload = serde_json::to_vec(value).unwrap_or_default();
        self.publish(topic, payload, config).await
    }

    async fn test_connection(&self, config: &serde_json::Value) -> bool {
        if self.connection.lock().await.is_none() && self.connect(config).await.is_err() {
            return false;
        }
        // Give the event loop a moment to complete the handshake.
        for _ in 0..20 {
            if let Some(ref conn) = *self.connection.lock().await {
                if conn.connected.load(Ordering::Acquire) {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    fn validate_config(&self, config: &serde_json::Value) -> Vec<String> {
        let mut errors = Vec::new();
        if config.get("broker_host").and_then(|v| v.as_str()).is_none() {
            errors.push("broker_host is required".to_string());
        }
        if let Some(qos) = config.get("qos").and_then(|v| v.as_u64()) {
            if qos > 2 {
                errors.push(format!("qos must be 0, 1 or 2 — got {}", qos));
            }
        }
        if let Some(format) = config.get("message_format").and_then(|v| v.as_str()) {
            if !matches!(format, "json" | "text") {
                errors.push(format!("unsupported message_format '{}'", format));
            }
        }
        errors
    }

    fn status(&self) -> serde_json::Value {
        json!({
            "type": "MQTT",
            "publish_count": self.publish_count.load(Ordering::Relaxed),
            "success_count": self.success_count.load(Ordering::Relaxed),
            "queued_count": self.queued_count.load(Ordering::Relaxed),
        })
    }

    async fn cleanup(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            let _ = conn.client.disconnect().await;
            conn.event_loop.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alarm() -> CspAlarmMessage {
        CspAlarmMessage::sample(101, "boiler_temp", 150.5, true)
    }

    #[test]
    fn topic_pattern_expansion() {
        let topic = MqttTargetHandler::topic_for(
            &alarm(),
            &json!({"topic_pattern": "plant/{building_id}/{point_name}"}),
        );
        assert_eq!(topic, "plant/101/boiler_temp");
    }

    #[test]
    fn json_payload_with_metadata_and_extras() {
        let payload = MqttTargetHandler::payload_for(
            &alarm(),
            &json!({
                "include_metadata": true,
                "additional_fields": {"site_group": "north"},
            }),
        );
        let parsed: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["bd"], 101);
        assert_eq!(parsed["exported_by"], "pulseone-gateway");
        assert_eq!(parsed["site_group"], "north");
    }

    #[test]
    fn text_payload_is_flat() {
        let payload =
            MqttTargetHandler::payload_for(&alarm(), &json!({"message_format": "text"}));
        let text = String::from_utf8(payload).unwrap();
        assert!(text.contains("101 boiler_temp 150.5 1"));
    }

    #[test]
    fn validation() {
        let handler = MqttTargetHandler::new();
        let errors = handler.validate_config(&json!({"qos": 3, "message_format": "xml"}));
        assert_eq!(errors.len(), 3);
        assert!(handler
            .validate_config(&json!({"broker_host": "localhost", "qos": 1}))
            .is_empty());
    }
}
