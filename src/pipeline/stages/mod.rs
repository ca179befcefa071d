//! Pipeline stages
//!
//! Each stage implements [`PipelineStage`]; returning `false` aborts the
//! chain for that message. Stage order is fixed:
//! Enrichment → Alarm → Persistence.

mod alarm;
mod enrichment;
mod persistence;

pub use alarm::AlarmStage;
pub use enrichment::EnrichmentStage;
pub use persistence::PersistenceStage;

use async_trait::async_trait;

use super::context::PipelineContext;

/// One stage in the data processing pipeline.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Stage name for logging.
    fn name(&self) -> &'static str;

    /// Process the context. `false` stops the chain for this message.
    async fn process(&self, context: &mut PipelineContext) -> bool;
}
