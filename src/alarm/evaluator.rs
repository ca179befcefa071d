//! Alarm evaluator
//!
//! Pure condition check against a rule plus the state cache: analog limits
//! in HIGH_HIGH → HIGH → LOW_LOW → LOW priority, digital truthiness, or a
//! condition script. Transition detection compares the fired condition
//! against the cache's view of whether the alarm is already active.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::scripting::{ScriptExecutor, ScriptInputs};
use crate::types::{AlarmRule, AlarmSeverity, AlarmType, ConditionMet, Value};

use super::state_cache::AlarmStateCache;

/// Outcome of evaluating one rule against one value.
#[derive(Debug, Clone)]
pub struct AlarmEvaluation {
    pub rule_id: i64,
    pub tenant_id: i32,
    pub timestamp: DateTime<Utc>,
    pub should_trigger: bool,
    pub should_clear: bool,
    pub state_changed: bool,
    pub severity: AlarmSeverity,
    pub condition_met: ConditionMet,
}

impl AlarmEvaluation {
    fn quiet(rule: &AlarmRule) -> Self {
        Self {
            rule_id: rule.id,
            tenant_id: rule.tenant_id,
            timestamp: Utc::now(),
            should_trigger: false,
            should_clear: false,
            state_changed: false,
            severity: rule.severity,
            condition_met: ConditionMet::None,
        }
    }
}

pub struct AlarmEvaluator {
    executor: Arc<ScriptExecutor>,
    state_cache: Arc<AlarmStateCache>,
}

impl AlarmEvaluator {
    pub fn new(executor: Arc<ScriptExecutor>, state_cache: Arc<AlarmStateCache>) -> Self {
        Self {
            executor,
            state_cache,
        }
    }

    /// Evaluate a rule against a raw value.
    ///
    /// Never touches the database; the state cache decides whether a fired
    /// (or quiet) condition is a transition.
    pub fn evaluate(&self, rule: &AlarmRule, raw_value: &Value) -> AlarmEvaluation {
        match rule.alarm_type {
            AlarmType::Analog => self.evaluate_analog(rule, raw_value.as_f64()),
            AlarmType::Digital => self.evaluate_digital(rule, raw_value.as_bool()),
            AlarmType::Script => self.evaluate_script(rule, raw_value),
        }
    }

    fn evaluate_analog(&self, rule: &AlarmRule, value: f64) -> AlarmEvaluation {
        let mut eval = AlarmEvaluation::quiet(rule);

        // Populated limits in priority order: high_high beats high,
        // low_low beats low.
        eval.condition_met = if rule.high_high.is_some_and(|limit| value >= limit) {
            ConditionMet::HighHigh
        } else if rule.high.is_some_and(|limit| value >= limit) {
            ConditionMet::High
        } else if rule.low_low.is_some_and(|limit| value <= limit) {
            ConditionMet::LowLow
        } else if rule.low.is_some_and(|limit| value <= limit) {
            ConditionMet::Low
        } else {
            ConditionMet::None
        };

        let triggered = eval.condition_met != ConditionMet::None;
        self.resolve_transition(rule, triggered, &mut eval);
        eval
    }

    fn evaluate_digital(&self, rule: &AlarmRule, value: bool) -> AlarmEvaluation {
        let mut eval = AlarmEvaluation::quiet(rule);
        if value {
            eval.condition_met = ConditionMet::High;
        }
        self.resolve_transition(rule, value, &mut eval);
        eval
    }

    fn evaluate_script(&self, rule: &AlarmRule, raw_value: &Value) -> AlarmEvaluation {
        let mut eval = AlarmEvaluation::quiet(rule);

        let Some(script) = rule.condition_script.as_deref() else {
            warn!(rule_id = rule.id, "SCRIPT rule without condition script");
            return eval;
        };

        let mut inputs = ScriptInputs::new();
        inputs.set("value", raw_value.clone());
        let outcome = self.executor.execute_safe(script, rule.tenant_id, &inputs);

        // A failed script is treated as not-triggered: the rule is skipped
        // for this message, other rules continue.
        let triggered = match outcome.value {
            Some(value) if outcome.success => value.as_bool(),
            _ => {
                debug!(
                    rule_id = rule.id,
                    error = %outcome.error_message,
                    input = %raw_value,
                    "Condition script failed — rule skipped"
                );
                false
            }
        };
        if triggered {
            eval.condition_met = ConditionMet::High;
        }
        self.resolve_transition(rule, triggered, &mut eval);
        eval
    }

    fn resolve_transition(&self, rule: &AlarmRule, triggered: bool, eval: &mut AlarmEvaluation) {
        let status = self.state_cache.alarm_status(rule.id);
        if triggered && !status.is_active {
            eval.should_trigger = true;
            eval.state_changed = true;
        } else if !triggered && status.is_active {
            eval.should_clear = true;
            eval.state_changed = true;
        }
    }
}
