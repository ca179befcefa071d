//! Alarm subsystem: rule registry, state cache, evaluator, startup recovery

mod evaluator;
mod recovery;
mod registry;
mod state_cache;

pub use evaluator::{AlarmEvaluation, AlarmEvaluator};
pub use recovery::{AlarmStartupRecovery, RecoveryPolicy, RecoveryStats};
pub use registry::AlarmRuleRegistry;
pub use state_cache::{AlarmStateCache, AlarmStatus, PointState};
