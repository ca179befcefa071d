//! Enrichment stage: virtual point computation

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::pipeline::context::PipelineContext;
use crate::virtual_point::VirtualPointEngine;

use super::PipelineStage;

/// Appends computed virtual points to the enriched message.
///
/// Best-effort: an engine that is not ready, or a formula that fails, still
/// lets the rest of the chain run on the raw points.
pub struct EnrichmentStage {
    engine: Arc<VirtualPointEngine>,
}

impl EnrichmentStage {
    pub fn new(engine: Arc<VirtualPointEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PipelineStage for EnrichmentStage {
    fn name(&self) -> &'static str {
        "enrichment"
    }

    async fn process(&self, context: &mut PipelineContext) -> bool {
        if !self.engine.is_ready() {
            return true;
        }

        let synthetic = self.engine.calculate_for_message(&context.message);
        if synthetic.is_empty() {
            return true;
        }

        context.stats.virtual_points_added = synthetic.len();
        debug!(
            device_id = context.message.device_id,
            virtual_points = synthetic.len(),
            "Message enriched"
        );
        context.enriched_message.points.extend(synthetic);
        true
    }
}
