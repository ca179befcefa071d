//! Data processing pipeline
//!
//! ```text
//! driver → DataProcessingService (bounded queue, worker pool)
//!            └─ EnrichmentStage  (virtual points)
//!            └─ AlarmStage       (rule evaluation, occurrence lifecycle)
//!            └─ PersistenceStage (Redis hot path + slow-sink lanes)
//! ```
//!
//! Within one message the stage order is strictly sequential; across
//! messages only the per-rule transition order is preserved (by the state
//! cache's exclusive lock).

mod context;
mod service;
pub mod stages;

pub use context::{ContextStats, PipelineContext};
pub use service::{DataProcessingService, PipelineStats};
pub use stages::{AlarmStage, EnrichmentStage, PersistenceStage, PipelineStage};
