//! Gateway-side integration: circuit breaker lifecycle through the runner,
//! file export fan-out, and the subscriber → dispatcher → runner path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use pulseone::gateway::{
    EventSubscriber, GatewayDispatcher, SubscriberConfig, TargetHandler, TargetHandlerFactory,
    TargetRegistry, TargetRunner,
};
use pulseone::storage::{MemoryTargetRepository, TargetLoadData};
use pulseone::types::{
    AlarmEventData, AlarmSeverity, AlarmState, CspAlarmMessage, CspValueMessage, DynamicTarget,
    TargetSendResult, TargetType,
};

/// Scriptable handler standing in for a flaky HTTP endpoint.
struct FlakyHandler {
    healthy: Arc<AtomicBool>,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl TargetHandler for FlakyHandler {
    fn handler_type(&self) -> &'static str {
        "HTTP"
    }

    async fn send_alarm(
        &self,
        _alarm: &CspAlarmMessage,
        _config: &serde_json::Value,
    ) -> TargetSendResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let healthy = self.healthy.load(Ordering::SeqCst);
        TargetSendResult {
            success: healthy,
            status_code: if healthy { 200 } else { 500 },
            error_message: if healthy {
                String::new()
            } else {
                "HTTP status 500".to_string()
            },
            ..TargetSendResult::default()
        }
    }

    async fn send_value(
        &self,
        _value: &CspValueMessage,
        _config: &serde_json::Value,
    ) -> TargetSendResult {
        TargetSendResult::default()
    }

    async fn test_connection(&self, _config: &serde_json::Value) -> bool {
        true
    }

    fn validate_config(&self, _config: &serde_json::Value) -> Vec<String> {
        Vec::new()
    }
}

fn http_target(id: i64, name: &str) -> DynamicTarget {
    DynamicTarget {
        id,
        name: name.to_string(),
        target_type: TargetType::Http,
        enabled: true,
        execution_order: 1,
        execution_delay_ms: 0,
        priority: 0,
        config: json!({
            "url": "https://upstream.example/alarms",
            "failure_threshold": 3,
            "recovery_timeout_ms": 400,
            "half_open_requests": 2,
        }),
        description: String::new(),
    }
}

async fn runner_with_flaky_http() -> (TargetRunner, Arc<AtomicBool>, Arc<AtomicU32>) {
    let healthy = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicU32::new(0));

    let factory = TargetHandlerFactory::new();
    let handler_healthy = Arc::clone(&healthy);
    let handler_calls = Arc::clone(&calls);
    factory.register("HTTP", move || {
        Arc::new(FlakyHandler {
            healthy: Arc::clone(&handler_healthy),
            calls: Arc::clone(&handler_calls),
        })
    });

    let registry = Arc::new(TargetRegistry::new(
        Arc::new(MemoryTargetRepository::new(TargetLoadData {
            targets: vec![http_target(1, "http_a")],
            ..TargetLoadData::default()
        })),
        factory,
    ));
    assert!(registry.load(1).await);
    (TargetRunner::new(registry), healthy, calls)
}

fn alarm() -> CspAlarmMessage {
    CspAlarmMessage::sample(101, "boiler_temp", 150.0, true)
}

#[tokio::test]
async fn breaker_opens_after_threshold_and_recovers_via_probes() {
    let (runner, healthy, calls) = runner_with_flaky_http().await;

    // Three consecutive 500s trip the breaker exactly at the threshold
    for _ in 0..3 {
        let result = runner.send_alarm_to_target("http_a", &alarm()).await;
        assert!(!result.success);
        assert_eq!(result.status_code, 500);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Open: rejected without invoking the handler
    let result = runner.send_alarm_to_target("http_a", &alarm()).await;
    assert!(!result.success);
    assert_eq!(result.error_message, "Circuit breaker open");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Endpoint heals; after the recovery timeout two clean probes close it
    healthy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let probe1 = runner.send_alarm_to_target("http_a", &alarm()).await;
    assert!(probe1.success);
    let probe2 = runner.send_alarm_to_target("http_a", &alarm()).await;
    assert!(probe2.success);

    // Closed again: ordinary sends flow
    let result = runner.send_alarm_to_target("http_a", &alarm()).await;
    assert!(result.success);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn subscriber_to_runner_file_export_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let data = TargetLoadData {
        targets: vec![DynamicTarget {
            id: 1,
            name: "file_log".to_string(),
            target_type: TargetType::File,
            enabled: true,
            execution_order: 1,
            execution_delay_ms: 0,
            priority: 0,
            config: json!({
                "base_path": tmp.path().to_str().unwrap(),
                "file_format": "txt",
                "filename_template": "all_alarms.log",
                "append_mode": true,
            }),
            description: String::new(),
        }],
        ..TargetLoadData::default()
    };
    let registry = Arc::new(TargetRegistry::new(
        Arc::new(MemoryTargetRepository::new(data)),
        TargetHandlerFactory::with_builtin_handlers(),
    ));
    registry.load(1).await;
    let runner = Arc::new(TargetRunner::new(Arc::clone(&registry)));

    let dispatcher = Arc::new(GatewayDispatcher::new(1, registry, Arc::clone(&runner)));
    let subscriber = EventSubscriber::new(
        SubscriberConfig {
            redis_url: "redis://127.0.0.1:1".to_string(),
            worker_count: 1,
            queue_capacity: 32,
        },
        dispatcher,
    );
    let cancel = CancellationToken::new();
    subscriber.start_workers(&cancel);

    for (occurrence, building) in [(1i64, 101), (2, 102), (3, 103), (4, 101), (5, 104)] {
        let payload = serde_json::to_string(&AlarmEventData {
            event_type: AlarmEventData::EVENT_TYPE.to_string(),
            occurrence_id: occurrence,
            rule_id: 10,
            tenant_id: building,
            device_id: Some(7),
            point_id: Some(occurrence),
            message: "limit crossed".to_string(),
            severity: AlarmSeverity::High,
            state: AlarmState::Active,
            timestamp: 1_705_564_800_000,
            source_name: format!("p{}", occurrence),
            location: String::new(),
            trigger_value: "150".to_string(),
        })
        .unwrap();
        subscriber.route_message("alarms:processed", &payload).await;
    }
    subscriber.stop().await;

    let content = std::fs::read_to_string(tmp.path().join("all_alarms.log")).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 5);
    assert!(lines[0].contains("building=101") && lines[0].contains("point=p1"));
    assert!(lines[2].contains("building=103"));
    assert!(lines[4].contains("building=104") && lines[4].contains("point=p5"));

    let stats = runner.stats();
    assert_eq!(stats.total_exports, 5);
    assert_eq!(stats.successful_exports, 5);
}

#[tokio::test]
async fn dispatcher_command_resets_protector() {
    let (runner, healthy, _calls) = runner_with_flaky_http().await;
    let runner = Arc::new(runner);

    for _ in 0..3 {
        runner.send_alarm_to_target("http_a", &alarm()).await;
    }
    let blocked = runner.send_alarm_to_target("http_a", &alarm()).await;
    assert_eq!(blocked.error_message, "Circuit breaker open");

    // Admin command path: reset via the dispatcher
    let registry = Arc::new(TargetRegistry::new(
        Arc::new(MemoryTargetRepository::new(TargetLoadData::default())),
        TargetHandlerFactory::new(),
    ));
    let dispatcher = GatewayDispatcher::new(1, registry, Arc::clone(&runner));
    use pulseone::gateway::EventDispatcher;
    dispatcher
        .on_command("cmd:gateway:1", r#"{"command":"reset_protector","target":"http_a"}"#)
        .await;

    healthy.store(true, Ordering::SeqCst);
    let result = runner.send_alarm_to_target("http_a", &alarm()).await;
    assert!(result.success);
}

#[tokio::test]
async fn priority_overrides_reorder_targets() {
    let tmp = tempfile::tempdir().unwrap();
    let make_target = |id: i64, name: &str, order: i32| DynamicTarget {
        id,
        name: name.to_string(),
        target_type: TargetType::File,
        enabled: true,
        execution_order: order,
        execution_delay_ms: 0,
        priority: 0,
        config: json!({"base_path": tmp.path().to_str().unwrap()}),
        description: String::new(),
    };
    let registry = Arc::new(TargetRegistry::new(
        Arc::new(MemoryTargetRepository::new(TargetLoadData {
            targets: vec![make_target(1, "first", 1), make_target(2, "second", 2)],
            ..TargetLoadData::default()
        })),
        TargetHandlerFactory::with_builtin_handlers(),
    ));
    registry.set_target_priorities(HashMap::from([(2, 0)]));
    registry.load(1).await;

    let names: Vec<String> = registry.all_targets().iter().map(|t| t.name.clone()).collect();
    assert_eq!(names, vec!["second", "first"]);
}
