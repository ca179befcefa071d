//! PulseOne: industrial data acquisition and export platform
//!
//! ## Architecture
//!
//! - **Pipeline**: protocol messages flow Enrichment → Alarm → Persistence
//!   through a bounded queue and worker pool
//! - **Alarm subsystem**: rule registry, stateful evaluator, occurrence
//!   lifecycle, cold-start recovery into the Redis publish bus
//! - **Export gateway**: pub/sub subscriber, dynamic target registry,
//!   circuit-breaker-protected runners for HTTP/S3/FILE/MQTT sinks

pub mod alarm;
pub mod config;
pub mod gateway;
pub mod pipeline;
pub mod scripting;
pub mod storage;
pub mod types;
pub mod util;
pub mod virtual_point;

// Re-export the types most callers touch
pub use types::{
    AlarmEvent, AlarmEventData, AlarmOccurrence, AlarmRule, AlarmSeverity, AlarmState,
    CspAlarmMessage, DeviceDataMessage, DynamicTarget, Quality, TargetSendResult,
    TimestampedValue, Value,
};

pub use alarm::{AlarmEvaluator, AlarmRuleRegistry, AlarmStartupRecovery, AlarmStateCache};
pub use pipeline::{DataProcessingService, PipelineContext};
pub use scripting::{ScriptExecutor, ScriptLibrary};
pub use virtual_point::VirtualPointEngine;
