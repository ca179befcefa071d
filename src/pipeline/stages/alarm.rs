//! Alarm stage: rule evaluation and occurrence lifecycle

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::alarm::{AlarmEvaluator, AlarmRuleRegistry, AlarmStateCache};
use crate::pipeline::context::PipelineContext;
use crate::storage::AlarmOccurrenceRepository;
use crate::types::{
    AlarmEvent, AlarmOccurrence, AlarmRule, AlarmState, ConditionMet, TimestampedValue,
};

use super::PipelineStage;

/// Evaluates every point of the enriched message against its rules and
/// turns state changes into occurrence records and alarm events.
///
/// Per-rule failures never abort the chain; the offending rule is skipped
/// for this message.
pub struct AlarmStage {
    registry: Arc<AlarmRuleRegistry>,
    evaluator: Arc<AlarmEvaluator>,
    state_cache: Arc<AlarmStateCache>,
    occurrences: Arc<dyn AlarmOccurrenceRepository>,
    /// Occurrence ids issued locally when the repository is unreachable.
    fallback_occurrence_id: AtomicI64,
}

impl AlarmStage {
    pub fn new(
        registry: Arc<AlarmRuleRegistry>,
        evaluator: Arc<AlarmEvaluator>,
        state_cache: Arc<AlarmStateCache>,
        occurrences: Arc<dyn AlarmOccurrenceRepository>,
    ) -> Self {
        Self {
            registry,
            evaluator,
            state_cache,
            occurrences,
            fallback_occurrence_id: AtomicI64::new(1),
        }
    }

    async fn handle_trigger(
        &self,
        context: &mut PipelineContext,
        rule: &AlarmRule,
        point: &TimestampedValue,
        condition_met: ConditionMet,
    ) {
        let message = describe_trigger(rule, point, condition_met);
        let mut occurrence = AlarmOccurrence {
            id: 0,
            rule_id: rule.id,
            tenant_id: rule.tenant_id,
            point_id: Some(point.point_id),
            device_id: Some(context.enriched_message.device_id),
            state: AlarmState::Active,
            severity: rule.severity,
            trigger_value: point.value.to_string(),
            message: message.clone(),
            occurrence_time: point.timestamp,
            acknowledged_time: None,
            source_name: format!("point_{}", point.point_id),
            location: String::new(),
        };

        let occurrence_id = match self.occurrences.insert(&occurrence).await {
            Ok(id) => id,
            Err(e) => {
                let id = self.fallback_occurrence_id.fetch_add(1, Ordering::SeqCst);
                warn!(rule_id = rule.id, error = %e, fallback_id = id, "Occurrence insert failed — using local id");
                id
            }
        };
        occurrence.id = occurrence_id;

        info!(
            rule_id = rule.id,
            occurrence_id,
            point_id = point.point_id,
            severity = ?rule.severity,
            condition = ?condition_met,
            "Alarm triggered"
        );

        context.alarm_events.push(AlarmEvent {
            occurrence_id,
            rule_id: rule.id,
            tenant_id: rule.tenant_id,
            point_id: Some(point.point_id),
            device_id: Some(context.enriched_message.device_id),
            state: AlarmState::Active,
            severity: rule.severity,
            condition_met,
            message,
            trigger_value: point.value.clone(),
            timestamp: point.timestamp,
            source_name: occurrence.source_name.clone(),
            location: occurrence.location.clone(),
        });
        context.stats.alarms_triggered += 1;
        self.state_cache.set_alarm_status(rule.id, true, occurrence_id);
    }

    async fn handle_clear(
        &self,
        context: &mut PipelineContext,
        rule: &AlarmRule,
        point: &TimestampedValue,
    ) {
        let status = self.state_cache.alarm_status(rule.id);
        let occurrence_id = status.occurrence_id;
        if occurrence_id == 0 {
            // Cache says active but no occurrence recorded — force-clear
            // and move on rather than blocking other messages.
            warn!(rule_id = rule.id, "Clear without occurrence id — force-clearing cache");
        } else if let Err(e) = self
            .occurrences
            .update_state(occurrence_id, AlarmState::Cleared)
            .await
        {
            warn!(rule_id = rule.id, occurrence_id, error = %e, "Occurrence clear update failed");
        }

        info!(
            rule_id = rule.id,
            occurrence_id,
            point_id = point.point_id,
            "Alarm cleared"
        );

        context.alarm_events.push(AlarmEvent {
            occurrence_id,
            rule_id: rule.id,
            tenant_id: rule.tenant_id,
            point_id: Some(point.point_id),
            device_id: Some(context.enriched_message.device_id),
            state: AlarmState::Cleared,
            severity: rule.severity,
            condition_met: ConditionMet::None,
            message: format!("point_{} back to normal", point.point_id),
            trigger_value: point.value.clone(),
            timestamp: point.timestamp,
            source_name: format!("point_{}", point.point_id),
            location: String::new(),
        });
        self.state_cache.set_alarm_status(rule.id, false, 0);
    }
}

#[async_trait]
impl PipelineStage for AlarmStage {
    fn name(&self) -> &'static str {
        "alarm"
    }

    async fn process(&self, context: &mut PipelineContext) -> bool {
        if !context.should_evaluate_alarms {
            debug!("Alarm stage skipped (evaluation disabled)");
            return true;
        }

        let tenant_id = context.enriched_message.tenant_id;
        if !self.registry.is_tenant_loaded(tenant_id) {
            self.registry.load_rules(tenant_id).await;
        }

        let points = context.enriched_message.points.clone();
        for point in &points {
            self.state_cache.update_point_state(point.point_id, &point.value);

            let rules = self.registry.rules_for_point(tenant_id, point.point_id);
            for rule in &rules {
                let eval = self.evaluator.evaluate(rule, &point.value);
                if !eval.state_changed {
                    continue;
                }
                if eval.should_trigger {
                    self.handle_trigger(context, rule, point, eval.condition_met)
                        .await;
                } else if eval.should_clear {
                    self.handle_clear(context, rule, point).await;
                }
            }
        }

        if !context.alarm_events.is_empty() {
            debug!(
                device_id = context.enriched_message.device_id,
                events = context.alarm_events.len(),
                "Alarm stage produced events"
            );
        }
        true
    }
}

fn describe_trigger(rule: &AlarmRule, point: &TimestampedValue, condition: ConditionMet) -> String {
    let limit = match condition {
        ConditionMet::HighHigh => rule.high_high,
        ConditionMet::High => rule.high,
        ConditionMet::Low => rule.low,
        ConditionMet::LowLow => rule.low_low,
        ConditionMet::None => None,
    };
    match limit {
        Some(limit) => format!(
            "point_{} value {} crossed {:?} limit {}",
            point.point_id, point.value, condition, limit
        ),
        None => format!("point_{} alarm condition met ({})", point.point_id, point.value),
    }
}
