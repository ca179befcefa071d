//! End-to-end pipeline tests: enrichment → alarm → persistence against
//! in-memory Redis and repository doubles.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use pulseone::alarm::{AlarmEvaluator, AlarmRuleRegistry, AlarmStateCache};
use pulseone::config::PipelineConfig;
use pulseone::pipeline::{
    AlarmStage, DataProcessingService, EnrichmentStage, PersistenceStage, PipelineContext,
    PipelineStage,
};
use pulseone::scripting::{ScriptExecutor, ScriptLibrary};
use pulseone::storage::{
    MemoryAlarmRuleRepository, MemoryOccurrenceRepository, MemoryPersistenceSink,
    MemorySink, MemoryVirtualPointRepository, PersistenceQueue, PersistenceSink,
    RedisDataWriter, RedisSink,
};
use pulseone::types::{
    AlarmEventData, AlarmRule, AlarmSeverity, AlarmState, AlarmTargetType, AlarmType,
    DeviceDataMessage, TimestampedValue, Value, VirtualDataType, VirtualPoint,
    VirtualPointDependency,
};
use pulseone::virtual_point::VirtualPointEngine;

struct TestPipeline {
    stages: Vec<Box<dyn PipelineStage>>,
    sink: Arc<MemorySink>,
    state_cache: Arc<AlarmStateCache>,
    occurrences: Arc<MemoryOccurrenceRepository>,
    persistence: Arc<MemoryPersistenceSink>,
    queue: Arc<PersistenceQueue>,
    cancel: CancellationToken,
}

fn analog_rule(id: i64, point_id: i64, high: f64, severity: AlarmSeverity) -> AlarmRule {
    AlarmRule {
        id,
        tenant_id: 1,
        target_type: AlarmTargetType::DataPoint,
        target_id: Some(point_id),
        alarm_type: AlarmType::Analog,
        high_high: None,
        high: Some(high),
        low: None,
        low_low: None,
        condition_script: None,
        severity,
        enabled: true,
    }
}

async fn build_pipeline(rules: Vec<AlarmRule>, virtual_points: Vec<VirtualPoint>) -> TestPipeline {
    let sink = Arc::new(MemorySink::new());
    let writer = Arc::new(RedisDataWriter::new(Arc::clone(&sink) as Arc<dyn RedisSink>));
    let state_cache = Arc::new(AlarmStateCache::new());
    let executor = Arc::new(ScriptExecutor::new(Arc::new(ScriptLibrary::new())));

    let vp_engine = Arc::new(VirtualPointEngine::new(
        Arc::new(MemoryVirtualPointRepository::new(virtual_points)),
        Arc::clone(&executor),
        Arc::clone(&state_cache),
    ));
    vp_engine.load_points(1).await;

    let registry = Arc::new(AlarmRuleRegistry::new(Arc::new(
        MemoryAlarmRuleRepository::new(rules),
    )));
    registry.load_rules(1).await;

    let evaluator = Arc::new(AlarmEvaluator::new(
        Arc::clone(&executor),
        Arc::clone(&state_cache),
    ));
    let occurrences = Arc::new(MemoryOccurrenceRepository::new());

    let persistence = Arc::new(MemoryPersistenceSink::default());
    let queue = Arc::new(PersistenceQueue::new(64));
    let cancel = CancellationToken::new();
    queue.start(
        Arc::clone(&persistence) as Arc<dyn PersistenceSink>,
        cancel.clone(),
    );

    let stages: Vec<Box<dyn PipelineStage>> = vec![
        Box::new(EnrichmentStage::new(vp_engine)),
        Box::new(AlarmStage::new(
            registry,
            evaluator,
            Arc::clone(&state_cache),
            Arc::clone(&occurrences) as Arc<dyn pulseone::storage::AlarmOccurrenceRepository>,
        )),
        Box::new(PersistenceStage::new(writer, Arc::clone(&queue))),
    ];

    TestPipeline {
        stages,
        sink,
        state_cache,
        occurrences,
        persistence,
        queue,
        cancel,
    }
}

impl TestPipeline {
    async fn process(&self, message: DeviceDataMessage) -> PipelineContext {
        let mut context = PipelineContext::new(message);
        for stage in &self.stages {
            assert!(stage.process(&mut context).await, "stage {} aborted", stage.name());
        }
        context
    }

    fn published_events(&self) -> Vec<AlarmEventData> {
        self.sink
            .published_on("alarms:processed")
            .iter()
            .map(|payload| serde_json::from_str(payload).unwrap())
            .collect()
    }
}

fn message(points: Vec<(i64, f64)>) -> DeviceDataMessage {
    DeviceDataMessage::new(
        7,
        1,
        points
            .into_iter()
            .map(|(id, value)| TimestampedValue::new(id, value))
            .collect(),
    )
}

#[tokio::test]
async fn analog_trigger_produces_event_key_and_cache_state() {
    let pipeline = build_pipeline(
        vec![analog_rule(10, 1, 100.0, AlarmSeverity::Critical)],
        Vec::new(),
    )
    .await;

    let context = pipeline.process(message(vec![(1, 150.0)])).await;

    assert_eq!(context.alarm_events.len(), 1);
    let event = &context.alarm_events[0];
    assert_eq!(event.state, AlarmState::Active);
    assert_eq!(event.severity, AlarmSeverity::Critical);
    assert!(event.occurrence_id > 0);

    // Redis side: active key set and wire-correct publish
    assert!(pipeline.sink.key("alarm:active:10").is_some());
    let published = pipeline.published_events();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].severity, AlarmSeverity::Critical);
    assert_eq!(published[0].state, AlarmState::Active);
    assert_eq!(published[0].rule_id, 10);

    // Cache agrees and the occurrence row exists
    assert!(pipeline.state_cache.is_active(10));
    assert_eq!(pipeline.occurrences.all().len(), 1);

    // Latest-value key written before queue fan-out
    assert!(pipeline.sink.key("point:1:latest").is_some());
    assert!(context.stats.persisted_to_redis);
}

#[tokio::test]
async fn clear_after_trigger_removes_key_and_deactivates() {
    let pipeline = build_pipeline(
        vec![analog_rule(10, 1, 100.0, AlarmSeverity::Critical)],
        Vec::new(),
    )
    .await;

    pipeline.process(message(vec![(1, 150.0)])).await;
    let context = pipeline.process(message(vec![(1, 50.0)])).await;

    assert_eq!(context.alarm_events.len(), 1);
    assert_eq!(context.alarm_events[0].state, AlarmState::Cleared);

    assert!(pipeline.sink.key("alarm:active:10").is_none());
    assert!(!pipeline.state_cache.is_active(10));

    let published = pipeline.published_events();
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].state, AlarmState::Cleared);

    // Repeated normal values cause no further transitions
    let context = pipeline.process(message(vec![(1, 60.0)])).await;
    assert!(context.alarm_events.is_empty());
}

#[tokio::test]
async fn virtual_point_enriches_before_alarm_evaluation() {
    let vp = VirtualPoint {
        id: 100,
        tenant_id: 1,
        name: "doubled".to_string(),
        formula: "raw_val * 2".to_string(),
        dependencies: vec![VirtualPointDependency {
            point_id: 1,
            variable_name: "raw_val".to_string(),
        }],
        data_type: VirtualDataType::Float,
        enabled: true,
    };
    let pipeline = build_pipeline(
        vec![analog_rule(20, 100, 250.0, AlarmSeverity::High)],
        vec![vp],
    )
    .await;

    let context = pipeline.process(message(vec![(1, 150.0)])).await;

    // Enrichment appended the synthetic point (never removing any)
    assert_eq!(context.message.points.len(), 1);
    assert_eq!(context.enriched_message.points.len(), 2);
    let synthetic = &context.enriched_message.points[1];
    assert_eq!(synthetic.point_id, 100);
    assert_eq!(synthetic.value, Value::Float(300.0));
    assert_eq!(synthetic.source, "virtual");

    // The rule watching the virtual point fired on the synthetic value
    assert_eq!(context.alarm_events.len(), 1);
    assert_eq!(context.alarm_events[0].rule_id, 20);
    assert!(pipeline.state_cache.is_active(20));
}

#[tokio::test]
async fn persistence_lanes_receive_enriched_payload() {
    let pipeline = build_pipeline(
        vec![analog_rule(10, 1, 100.0, AlarmSeverity::Critical)],
        Vec::new(),
    )
    .await;

    pipeline.process(message(vec![(1, 150.0)])).await;
    pipeline.cancel.cancel();
    pipeline.queue.stop().await;

    let rdb = pipeline.persistence.rdb.lock().unwrap();
    assert_eq!(rdb.len(), 1);
    assert_eq!(rdb[0].points.len(), 1);
    let comm = pipeline.persistence.comm_stats.lock().unwrap();
    assert_eq!(comm.len(), 1);
    assert_eq!(comm[0].device_id, 7);
}

#[tokio::test]
async fn service_processes_messages_through_worker_pool() {
    let pipeline = build_pipeline(
        vec![analog_rule(10, 1, 100.0, AlarmSeverity::Critical)],
        Vec::new(),
    )
    .await;

    // One worker keeps the rule's trigger/clear sequence deterministic here
    let config = PipelineConfig {
        worker_count: 1,
        queue_capacity: 16,
        overflow: "block".to_string(),
        drain_grace_ms: 2_000,
        persistence_queue_capacity: 64,
    };
    let service = DataProcessingService::new(pipeline.stages, &config);
    service.start();

    for _ in 0..5 {
        service
            .send_device_data(message(vec![(1, 150.0)]))
            .await
            .unwrap();
    }
    service.stop().await;

    let stats = service.stats();
    assert_eq!(stats.messages_processed, 5);
    // Only the first crossing triggers; the cache suppresses the rest
    assert_eq!(stats.alarms_triggered, 1);
    assert!(pipeline.state_cache.is_active(10));
}
