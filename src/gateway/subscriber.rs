//! Gateway event subscriber
//!
//! Redis pub/sub consumer with selective channel subscription. The I/O
//! loop parses and filters messages, then hands alarms to a bounded worker
//! queue — dispatcher callbacks never run on the connection task. On
//! disconnect, workers keep draining while the connection loop reconnects
//! with backoff and resubscribes every remembered channel.
//!
//! Channel routing:
//! - `alarms:*` → alarm path (parse, allow-list filter, worker queue)
//! - `cmd:gateway:<id>` → command handler
//! - `schedule:*` / `system:*` → dedicated dispatcher handlers

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::{
    CHANNEL_ALARMS_PROCESSED, SUBSCRIBER_RECONNECT_BASE_MS, SUBSCRIBER_RECONNECT_MAX_MS,
};
use crate::types::{AlarmEventData, CspAlarmMessage};
use crate::util::{BoundedQueue, OverflowPolicy};

/// Receives routed events off the subscriber's worker pool.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn on_alarm(&self, alarm: CspAlarmMessage);

    async fn on_schedule_event(&self, channel: &str, _payload: &str) {
        debug!(channel, "Schedule event ignored (no handler)");
    }

    async fn on_system_event(&self, channel: &str, _payload: &str) {
        debug!(channel, "System event ignored (no handler)");
    }

    async fn on_command(&self, channel: &str, _payload: &str) {
        debug!(channel, "Command ignored (no handler)");
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub redis_url: String,
    pub worker_count: usize,
    pub queue_capacity: usize,
}

/// Counters exposed for monitoring.
#[derive(Debug, Clone, Default)]
pub struct SubscriberStats {
    pub messages_received: u64,
    pub alarms_filtered: u64,
    pub alarms_dispatched: u64,
    pub parse_failures: u64,
    pub queue_dropped: u64,
}

pub struct EventSubscriber {
    config: SubscriberConfig,
    dispatcher: Arc<dyn EventDispatcher>,
    channels: Mutex<HashSet<String>>,
    /// Selective filter: empty set accepts every point.
    allowed_point_ids: Mutex<HashSet<i64>>,
    queue: Arc<BoundedQueue<CspAlarmMessage>>,
    resubscribe: Notify,
    workers: Mutex<Vec<JoinHandle<()>>>,
    received: AtomicU64,
    filtered: AtomicU64,
    dispatched: Arc<AtomicU64>,
    parse_failures: AtomicU64,
}

impl EventSubscriber {
    pub fn new(config: SubscriberConfig, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        let queue = Arc::new(BoundedQueue::new(
            config.queue_capacity,
            OverflowPolicy::DropOldest,
        ));
        let mut channels = HashSet::new();
        channels.insert(CHANNEL_ALARMS_PROCESSED.to_string());
        Self {
            config,
            dispatcher,
            channels: Mutex::new(channels),
            allowed_point_ids: Mutex::new(HashSet::new()),
            queue,
            resubscribe: Notify::new(),
            workers: Mutex::new(Vec::new()),
            received: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            dispatched: Arc::new(AtomicU64::new(0)),
            parse_failures: AtomicU64::new(0),
        }
    }

    /// Remember a channel; an active connection re-subscribes on the spot.
    pub fn subscribe_channel(&self, channel: &str) {
        let added = self
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.to_string());
        if added {
            self.resubscribe.notify_waiters();
            info!(channel, "Channel subscription added");
        }
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Install the selective point filter. An empty set accepts all.
    pub fn set_allowed_point_ids(&self, point_ids: HashSet<i64>) {
        let count = point_ids.len();
        *self
            .allowed_point_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = point_ids;
        info!(points = count, "Selective point filter updated");
    }

    /// Spawn the worker pool draining the alarm queue.
    pub fn start_workers(&self, cancel: &CancellationToken) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if !workers.is_empty() {
            return;
        }
        for index in 0..self.config.worker_count.max(1) {
            let queue = Arc::clone(&self.queue);
            let dispatcher = Arc::clone(&self.dispatcher);
            let dispatched = Arc::clone(&self.dispatched);
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                debug!(worker = index, "Subscriber worker started");
                loop {
                    let alarm = tokio::select! {
                        _ = cancel.cancelled() => break,
                        alarm = queue.pop() => match alarm {
                            Some(alarm) => alarm,
                            None => break,
                        },
                    };
                    dispatcher.on_alarm(alarm).await;
                    dispatched.fetch_add(1, Ordering::Relaxed);
                }
                debug!(worker = index, "Subscriber worker exited");
            }));
        }
    }

    /// Connection loop: subscribe, pump messages, reconnect with backoff.
    /// Returns when cancelled. Redis being down at start is not fatal —
    /// the loop just keeps retrying.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = Duration::from_millis(SUBSCRIBER_RECONNECT_BASE_MS);
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.connect_and_listen(&cancel).await {
                ListenEnd::Cancelled => break,
                ListenEnd::Resubscribe => {
                    backoff = Duration::from_millis(SUBSCRIBER_RECONNECT_BASE_MS);
                }
                ListenEnd::Error(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Subscriber connection lost — reconnecting");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff =
                        (backoff * 2).min(Duration::from_millis(SUBSCRIBER_RECONNECT_MAX_MS));
                }
            }
        }
        self.queue.close();
        info!("Event subscriber stopped");
    }

    async fn connect_and_listen(&self, cancel: &CancellationToken) -> ListenEnd {
        let client = match redis::Client::open(self.config.redis_url.as_str()) {
            Ok(client) => client,
            Err(e) => return ListenEnd::Error(e.to_string()),
        };
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => return ListenEnd::Error(e.to_string()),
        };

        let channels = self.subscribed_channels();
        for channel in &channels {
            if let Err(e) = pubsub.subscribe(channel).await {
                return ListenEnd::Error(format!("subscribe {}: {}", channel, e));
            }
        }
        info!(channels = channels.len(), "Subscriber connected");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return ListenEnd::Cancelled,
                _ = self.resubscribe.notified() => return ListenEnd::Resubscribe,
                message = stream.next() => match message {
                    Some(message) => {
                        let channel = message.get_channel_name().to_string();
                        let payload: String = message.get_payload().unwrap_or_default();
                        self.route_message(&channel, &payload).await;
                    }
                    None => return ListenEnd::Error("pub/sub stream ended".to_string()),
                },
            }
        }
    }

    /// Route one raw message. Public so the delivery path is testable
    /// without a broker.
    pub async fn route_message(&self, channel: &str, payload: &str) {
        self.received.fetch_add(1, Ordering::Relaxed);

        if channel.starts_with("alarms:") {
            self.handle_alarm_event(payload).await;
        } else if channel.starts_with("cmd:gateway:") {
            self.dispatcher.on_command(channel, payload).await;
        } else if channel.starts_with("schedule:") {
            self.dispatcher.on_schedule_event(channel, payload).await;
        } else if channel.starts_with("system:") {
            self.dispatcher.on_system_event(channel, payload).await;
        } else {
            debug!(channel, "Message on unrouted channel ignored");
        }
    }

    async fn handle_alarm_event(&self, payload: &str) {
        let Some(alarm) = parse_alarm_message(payload) else {
            self.parse_failures.fetch_add(1, Ordering::Relaxed);
            warn!(payload_len = payload.len(), "Unparseable alarm message dropped");
            return;
        };

        {
            let allowed = self
                .allowed_point_ids
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !allowed.is_empty() && !allowed.contains(&alarm.point_id) {
                self.filtered.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let _ = self.queue.push(alarm).await;
    }

    pub fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            messages_received: self.received.load(Ordering::Relaxed),
            alarms_filtered: self.filtered.load(Ordering::Relaxed),
            alarms_dispatched: self.dispatched.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            queue_dropped: self.queue.dropped_count(),
        }
    }

    /// Stop workers after the queue drains.
    pub async fn stop(&self) {
        self.queue.close();
        let workers: Vec<_> = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
    }
}

enum ListenEnd {
    Cancelled,
    Resubscribe,
    Error(String),
}

/// Parse either the backend `alarm_event` envelope or a raw CSP message.
fn parse_alarm_message(payload: &str) -> Option<CspAlarmMessage> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    if value.get("type").and_then(|v| v.as_str()) == Some(AlarmEventData::EVENT_TYPE) {
        let data: AlarmEventData = serde_json::from_value(value).ok()?;
        // Default building: the tenant. Per-target site mappings rewrite
        // this downstream in the runner.
        let building_id = data.tenant_id;
        return Some(CspAlarmMessage::from_event_data(&data, building_id));
    }
    if value.get("bd").is_some() {
        let point_id = value.get("point_id").and_then(|v| v.as_i64()).unwrap_or(0);
        let site_id = value.get("site_id").and_then(|v| v.as_i64());
        let mut alarm: CspAlarmMessage = serde_json::from_value(value).ok()?;
        alarm.point_id = point_id;
        alarm.site_id = site_id.map(|s| s as i32).unwrap_or(alarm.bd);
        return Some(alarm);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlarmSeverity, AlarmState};
    use std::sync::Mutex as StdMutex;

    struct RecordingDispatcher {
        alarms: StdMutex<Vec<CspAlarmMessage>>,
        commands: StdMutex<Vec<String>>,
    }

    impl RecordingDispatcher {
        fn new() -> Self {
            Self {
                alarms: StdMutex::new(Vec::new()),
                commands: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EventDispatcher for RecordingDispatcher {
        async fn on_alarm(&self, alarm: CspAlarmMessage) {
            self.alarms.lock().unwrap().push(alarm);
        }

        async fn on_command(&self, _channel: &str, payload: &str) {
            self.commands.lock().unwrap().push(payload.to_string());
        }
    }

    fn subscriber(dispatcher: Arc<RecordingDispatcher>) -> EventSubscriber {
        EventSubscriber::new(
            SubscriberConfig {
                redis_url: "redis://127.0.0.1:1".to_string(),
                worker_count: 1,
                queue_capacity: 16,
            },
            dispatcher,
        )
    }

    fn event_payload(point_id: i64) -> String {
        serde_json::to_string(&AlarmEventData {
            event_type: AlarmEventData::EVENT_TYPE.to_string(),
            occurrence_id: 1,
            rule_id: 10,
            tenant_id: 1,
            device_id: Some(7),
            point_id: Some(point_id),
            message: "high".to_string(),
            severity: AlarmSeverity::Critical,
            state: AlarmState::Active,
            timestamp: 1_705_564_800_000,
            source_name: "p1".to_string(),
            location: String::new(),
            trigger_value: "150".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn alarm_flows_to_dispatcher_via_workers() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let sub = subscriber(Arc::clone(&dispatcher));
        let cancel = CancellationToken::new();
        sub.start_workers(&cancel);

        sub.route_message(CHANNEL_ALARMS_PROCESSED, &event_payload(1)).await;
        sub.stop().await;

        let alarms = dispatcher.alarms.lock().unwrap();
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].point_id, 1);
        assert_eq!(alarms[0].al, 1);
        assert_eq!(alarms[0].nm, "p1");
    }

    #[tokio::test]
    async fn empty_filter_accepts_all_nonempty_filters() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let sub = subscriber(Arc::clone(&dispatcher));
        let cancel = CancellationToken::new();
        sub.start_workers(&cancel);

        sub.set_allowed_point_ids(HashSet::from([2, 3]));
        sub.route_message(CHANNEL_ALARMS_PROCESSED, &event_payload(1)).await;
        sub.route_message(CHANNEL_ALARMS_PROCESSED, &event_payload(2)).await;
        sub.stop().await;

        let alarms = dispatcher.alarms.lock().unwrap();
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].point_id, 2);
        assert_eq!(sub.stats().alarms_filtered, 1);
    }

    #[tokio::test]
    async fn command_channel_routes_to_command_handler() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let sub = subscriber(Arc::clone(&dispatcher));
        sub.route_message("cmd:gateway:3", "{\"command\":\"reload\"}").await;
        assert_eq!(dispatcher.commands.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unparseable_payload_counted() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let sub = subscriber(dispatcher);
        sub.route_message(CHANNEL_ALARMS_PROCESSED, "not json").await;
        assert_eq!(sub.stats().parse_failures, 1);
    }

    #[tokio::test]
    async fn legacy_csp_payload_parses() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let sub = subscriber(Arc::clone(&dispatcher));
        let cancel = CancellationToken::new();
        sub.start_workers(&cancel);

        let payload = r#"{"bd":101,"nm":"p1","vl":150.5,"tm":"2024-01-18 08:00:00.000","al":1,"st":1,"des":"x","point_id":9}"#;
        sub.route_message("alarms:all", payload).await;
        sub.stop().await;

        let alarms = dispatcher.alarms.lock().unwrap();
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].bd, 101);
        assert_eq!(alarms[0].point_id, 9);
    }
}
