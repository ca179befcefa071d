//! Per-message pipeline context

use crate::types::{AlarmEvent, DeviceDataMessage};

/// Statistics for one message's trip through the stage chain.
#[derive(Debug, Clone, Default)]
pub struct ContextStats {
    pub virtual_points_added: usize,
    pub alarms_triggered: usize,
    pub persisted_to_redis: bool,
    pub queued_for_rdb: bool,
    pub queued_for_series: bool,
}

/// Mutable bag passed between stages; destroyed at chain end.
///
/// `message` is the driver's original payload, `enriched_message` starts as
/// a copy and grows synthetic points. Enrichment never removes points, so
/// `enriched_message.points.len() >= message.points.len()` holds at every
/// stage boundary.
#[derive(Debug)]
pub struct PipelineContext {
    pub message: DeviceDataMessage,
    pub enriched_message: DeviceDataMessage,
    pub should_persist: bool,
    pub should_evaluate_alarms: bool,
    pub alarm_events: Vec<AlarmEvent>,
    pub stats: ContextStats,
    pub error_message: String,
}

impl PipelineContext {
    pub fn new(message: DeviceDataMessage) -> Self {
        let enriched_message = message.clone();
        Self {
            message,
            enriched_message,
            should_persist: true,
            should_evaluate_alarms: true,
            alarm_events: Vec::new(),
            stats: ContextStats::default(),
            error_message: String::new(),
        }
    }
}
