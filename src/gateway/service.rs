//! Gateway service
//!
//! Wires the export side together: loads the edge-server row (tenant,
//! subscription mode, priority overrides), loads the target registry,
//! configures the subscriber's selective filter or global subscription,
//! then runs heartbeat + subscriber until stopped. Redis being down at
//! start is non-fatal — the subscriber's reconnect loop keeps trying.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::defaults::CHANNEL_ALARMS_ALL;
use crate::config::defaults::CHANNEL_CMD_GATEWAY_PREFIX;
use crate::types::CspAlarmMessage;

use super::context::GatewayContext;
use super::heartbeat::HeartbeatService;
use super::registry::TargetRegistry;
use super::runner::TargetRunner;
use super::subscriber::{EventDispatcher, EventSubscriber, SubscriberConfig};

/// Routes subscriber events into the runner and admin commands into the
/// registry/protectors.
pub struct GatewayDispatcher {
    gateway_id: i64,
    registry: Arc<TargetRegistry>,
    runner: Arc<TargetRunner>,
}

impl GatewayDispatcher {
    pub fn new(gateway_id: i64, registry: Arc<TargetRegistry>, runner: Arc<TargetRunner>) -> Self {
        Self {
            gateway_id,
            registry,
            runner,
        }
    }
}

#[async_trait]
impl EventDispatcher for GatewayDispatcher {
    async fn on_alarm(&self, alarm: CspAlarmMessage) {
        let results = self.runner.send_alarm(&alarm).await;
        let failed = results.iter().filter(|r| !r.success).count();
        if failed > 0 {
            warn!(
                point_id = alarm.point_id,
                targets = results.len(),
                failed,
                "Alarm export had failures"
            );
        }
    }

    async fn on_command(&self, channel: &str, payload: &str) {
        let Ok(command) = serde_json::from_str::<serde_json::Value>(payload) else {
            warn!(channel, "Unparseable gateway command ignored");
            return;
        };
        match command.get("command").and_then(|v| v.as_str()) {
            Some("reload_targets") => {
                info!("Command: reloading target registry");
                self.registry.load(self.gateway_id).await;
            }
            Some("reset_protector") => match command.get("target").and_then(|v| v.as_str()) {
                Some(target) => self.runner.reset_protector(target),
                None => self.runner.reset_all_protectors(),
            },
            other => warn!(channel, command = ?other, "Unknown gateway command"),
        }
    }

    async fn on_schedule_event(&self, channel: &str, _payload: &str) {
        // Scheduled exports are driven externally; the event is logged so
        // operators can trace delivery.
        info!(channel, "Schedule event received");
    }

    async fn on_system_event(&self, channel: &str, payload: &str) {
        info!(channel, payload_len = payload.len(), "System event received");
    }
}

pub struct GatewayService {
    context: Arc<GatewayContext>,
    subscriber: Arc<EventSubscriber>,
    heartbeat: Arc<HeartbeatService>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl GatewayService {
    pub fn new(
        context: Arc<GatewayContext>,
        subscriber_config: SubscriberConfig,
        heartbeat_interval_secs: u64,
    ) -> Self {
        let dispatcher = Arc::new(GatewayDispatcher::new(
            context.gateway_id,
            Arc::clone(&context.registry),
            Arc::clone(&context.runner),
        ));
        let subscriber = Arc::new(EventSubscriber::new(subscriber_config, dispatcher));
        let heartbeat = Arc::new(HeartbeatService::new(
            context.gateway_id,
            heartbeat_interval_secs,
            Arc::clone(&context.edge_servers),
            Arc::clone(&context.redis),
        ));
        Self {
            context,
            subscriber,
            heartbeat,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn subscriber(&self) -> &Arc<EventSubscriber> {
        &self.subscriber
    }

    /// Bring the gateway up. Fails only on a registry load failure;
    /// everything network-side retries in the background.
    pub async fn start(&self) -> Result<(), String> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err("gateway already running".to_string());
        }
        let gateway_id = self.context.gateway_id;
        info!(gateway_id, "Gateway service starting");

        // 1. Edge-server row: tenant identity, subscription mode, priorities
        let mut subscription_mode = "selective".to_string();
        match self.context.edge_servers.find_by_id(gateway_id).await {
            Ok(Some(server)) => {
                self.context.set_tenant_id(server.tenant_id);
                subscription_mode = server.subscription_mode.clone();

                if let Some(priorities) = server
                    .config
                    .get("target_priorities")
                    .and_then(|v| v.as_object())
                {
                    let parsed: std::collections::HashMap<i64, i32> = priorities
                        .iter()
                        .filter_map(|(id, order)| {
                            Some((id.parse().ok()?, order.as_i64()? as i32))
                        })
                        .collect();
                    if !parsed.is_empty() {
                        info!(overrides = parsed.len(), "Applying target priority overrides");
                        self.context.registry.set_target_priorities(parsed);
                    }
                }
            }
            Ok(None) => warn!(gateway_id, "No edge-server row for this gateway"),
            Err(e) => error!(gateway_id, error = %e, "Edge-server lookup failed"),
        }

        // 2. Registry load (after overrides so ordering applies)
        if !self.context.registry.load(gateway_id).await {
            self.running.store(false, Ordering::SeqCst);
            return Err("target registry load failed".to_string());
        }

        // 3. Subscriptions: command channel always; alarms:all or the
        //    selective point filter depending on mode.
        self.subscriber
            .subscribe_channel(&format!("{}{}", CHANNEL_CMD_GATEWAY_PREFIX, gateway_id));
        if subscription_mode == "all" {
            self.subscriber.subscribe_channel(CHANNEL_ALARMS_ALL);
            info!("Subscription mode: all (global alarm fan-out)");
        } else {
            let points = self.context.registry.assigned_point_ids();
            if !points.is_empty() {
                self.subscriber.set_allowed_point_ids(points);
            }
            info!("Subscription mode: selective");
        }

        // 4. Background tasks
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let heartbeat = Arc::clone(&self.heartbeat);
        let heartbeat_cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            heartbeat.run(heartbeat_cancel).await;
        }));

        self.subscriber.start_workers(&self.cancel);
        let subscriber = Arc::clone(&self.subscriber);
        let subscriber_cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            subscriber.run(subscriber_cancel).await;
        }));

        info!(gateway_id, "Gateway service started");
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Gateway service stopping");
        self.cancel.cancel();
        self.subscriber.stop().await;

        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("Gateway service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
