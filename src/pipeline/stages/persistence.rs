//! Persistence stage: Redis hot path first, then the slow-sink lanes

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::pipeline::context::PipelineContext;
use crate::storage::{PersistenceQueue, RedisDataWriter};
use crate::types::AlarmEventData;

use super::PipelineStage;

/// Writes the enriched message to Redis, publishes its alarm events, and
/// queues the payload for the RDB, time-series, and comm-stats lanes.
///
/// The Redis write completes before any lane enqueue: downstream pub/sub
/// consumers may see an event before the RDB row lands, which is the
/// intended hot path. Redis being down degrades to
/// `persisted_to_redis = false` without failing the stage.
pub struct PersistenceStage {
    writer: Arc<RedisDataWriter>,
    queue: Arc<PersistenceQueue>,
}

impl PersistenceStage {
    pub fn new(writer: Arc<RedisDataWriter>, queue: Arc<PersistenceQueue>) -> Self {
        Self { writer, queue }
    }
}

#[async_trait]
impl PipelineStage for PersistenceStage {
    fn name(&self) -> &'static str {
        "persistence"
    }

    async fn process(&self, context: &mut PipelineContext) -> bool {
        if !context.should_persist {
            return true;
        }

        // 1. Redis (synchronous, best-effort)
        let saved = self.writer.save_device_message(&context.enriched_message).await;
        context.stats.persisted_to_redis = saved > 0;

        for event in &context.alarm_events {
            let data = AlarmEventData::from_event(event);
            if let Err(e) = self.writer.publish_alarm_event(&data).await {
                warn!(
                    rule_id = event.rule_id,
                    occurrence_id = event.occurrence_id,
                    error = %e,
                    "Alarm event publish failed"
                );
            }
        }

        // 2-4. Slow lanes, after the hot path
        let points = context.enriched_message.points.clone();
        self.queue
            .queue_rdb(&context.enriched_message, &points)
            .await;
        context.stats.queued_for_rdb = true;
        self.queue
            .queue_series(&context.enriched_message, &points)
            .await;
        context.stats.queued_for_series = true;
        self.queue.queue_comm_stats(&context.enriched_message).await;

        true
    }
}
