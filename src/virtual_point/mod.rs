//! Virtual point engine
//!
//! For each incoming message, computes the virtual points whose dependency
//! sets intersect the message's points and emits synthetic timestamped
//! values. Inputs come from the message first, falling back to the state
//! cache for dependencies the message did not carry. Failures are logged
//! per point and never abort the batch.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, error, info, warn};

use crate::alarm::AlarmStateCache;
use crate::scripting::{ScriptExecutor, ScriptInputs};
use crate::storage::VirtualPointRepository;
use crate::types::{
    DeviceDataMessage, Quality, TimestampedValue, Value, VirtualDataType, VirtualPoint,
};

/// Source tag stamped on synthetic values.
pub const VIRTUAL_SOURCE: &str = "virtual";

#[derive(Default)]
struct EngineInner {
    /// tenant → virtual points
    points: HashMap<i32, Vec<VirtualPoint>>,
    /// (tenant, dependency point) → indices into the tenant's vector
    dependency_index: HashMap<(i32, i64), Vec<usize>>,
}

pub struct VirtualPointEngine {
    repository: Arc<dyn VirtualPointRepository>,
    executor: Arc<ScriptExecutor>,
    state_cache: Arc<AlarmStateCache>,
    inner: RwLock<EngineInner>,
}

impl VirtualPointEngine {
    pub fn new(
        repository: Arc<dyn VirtualPointRepository>,
        executor: Arc<ScriptExecutor>,
        state_cache: Arc<AlarmStateCache>,
    ) -> Self {
        Self {
            repository,
            executor,
            state_cache,
            inner: RwLock::new(EngineInner::default()),
        }
    }

    /// Load (or reload) the enabled virtual points for a tenant and rebuild
    /// the dependency index.
    pub async fn load_points(&self, tenant_id: i32) {
        let points = match self.repository.find_enabled(tenant_id).await {
            Ok(points) => points,
            Err(e) => {
                error!(tenant_id, error = %e, "Failed to load virtual points");
                return;
            }
        };

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .dependency_index
            .retain(|(tenant, _), _| *tenant != tenant_id);
        for (idx, vp) in points.iter().enumerate() {
            for dep in &vp.dependencies {
                inner
                    .dependency_index
                    .entry((tenant_id, dep.point_id))
                    .or_default()
                    .push(idx);
            }
        }
        let count = points.len();
        inner.points.insert(tenant_id, points);
        drop(inner);

        info!(tenant_id, virtual_points = count, "Virtual points loaded");
    }

    pub fn is_ready(&self) -> bool {
        !self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .points
            .is_empty()
    }

    /// Compute every virtual point affected by this message.
    ///
    /// Each result carries the message timestamp so downstream alarm
    /// evaluation sees raw and synthetic values as one scan.
    pub fn calculate_for_message(&self, message: &DeviceDataMessage) -> Vec<TimestampedValue> {
        let affected = self.affected_points(message);
        if affected.is_empty() {
            return Vec::new();
        }

        let by_point: HashMap<i64, &TimestampedValue> =
            message.points.iter().map(|p| (p.point_id, p)).collect();

        let mut results = Vec::with_capacity(affected.len());
        for vp in affected {
            match self.calculate_one(&vp, &by_point, message) {
                Some(value) => results.push(value),
                None => {
                    warn!(vp_id = vp.id, name = %vp.name, "Virtual point skipped");
                }
            }
        }
        results
    }

    fn affected_points(&self, message: &DeviceDataMessage) -> Vec<VirtualPoint> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(points) = inner.points.get(&message.tenant_id) else {
            return Vec::new();
        };

        let mut indices: Vec<usize> = message
            .points
            .iter()
            .filter_map(|p| {
                inner
                    .dependency_index
                    .get(&(message.tenant_id, p.point_id))
            })
            .flatten()
            .copied()
            .collect();
        indices.sort_unstable();
        indices.dedup();

        indices.into_iter().filter_map(|i| points.get(i).cloned()).collect()
    }

    fn calculate_one(
        &self,
        vp: &VirtualPoint,
        by_point: &HashMap<i64, &TimestampedValue>,
        message: &DeviceDataMessage,
    ) -> Option<TimestampedValue> {
        let mut inputs = ScriptInputs::new();
        for dep in &vp.dependencies {
            let value = match by_point.get(&dep.point_id) {
                Some(tv) => tv.value.clone(),
                // Dependency not in this scan — use the last cached value.
                None => self.state_cache.point_state(dep.point_id).last_value,
            };
            inputs.set_point(dep.point_id, dep.variable_name.clone(), value);
        }

        let outcome = self
            .executor
            .execute_safe(&vp.formula, vp.tenant_id, &inputs);
        if !outcome.success {
            debug!(
                vp_id = vp.id,
                formula = %vp.formula,
                error = %outcome.error_message,
                "Virtual point formula failed"
            );
            return None;
        }

        let value = coerce(outcome.value?, vp.data_type);
        Some(TimestampedValue {
            point_id: vp.id,
            value,
            quality: Quality::Good,
            timestamp: message.timestamp,
            source: VIRTUAL_SOURCE.to_string(),
            value_changed: true,
        })
    }
}

fn coerce(value: Value, data_type: VirtualDataType) -> Value {
    match data_type {
        VirtualDataType::Float => Value::Float(value.as_f64()),
        VirtualDataType::Int => Value::Int(value.as_f64() as i64),
        VirtualDataType::Bool => Value::Bool(value.as_bool()),
        VirtualDataType::Text => Value::Text(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::ScriptLibrary;
    use crate::storage::MemoryVirtualPointRepository;
    use crate::types::VirtualPointDependency;

    fn make_vp(id: i64, formula: &str, deps: &[(i64, &str)]) -> VirtualPoint {
        VirtualPoint {
            id,
            tenant_id: 1,
            name: format!("vp_{}", id),
            formula: formula.to_string(),
            dependencies: deps
                .iter()
                .map(|(point_id, name)| VirtualPointDependency {
                    point_id: *point_id,
                    variable_name: (*name).to_string(),
                })
                .collect(),
            data_type: VirtualDataType::Float,
            enabled: true,
        }
    }

    async fn make_engine(points: Vec<VirtualPoint>) -> (VirtualPointEngine, Arc<AlarmStateCache>) {
        let cache = Arc::new(AlarmStateCache::new());
        let engine = VirtualPointEngine::new(
            Arc::new(MemoryVirtualPointRepository::new(points)),
            Arc::new(ScriptExecutor::new(Arc::new(ScriptLibrary::new()))),
            Arc::clone(&cache),
        );
        engine.load_points(1).await;
        (engine, cache)
    }

    #[tokio::test]
    async fn computes_dependent_point() {
        let (engine, _) = make_engine(vec![make_vp(100, "raw_val * 2", &[(1, "raw_val")])]).await;
        let msg = DeviceDataMessage::new(7, 1, vec![TimestampedValue::new(1, 150.0)]);

        let results = engine.calculate_for_message(&msg);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].point_id, 100);
        assert_eq!(results[0].value, Value::Float(300.0));
        assert_eq!(results[0].source, VIRTUAL_SOURCE);
        assert_eq!(results[0].timestamp, msg.timestamp);
    }

    #[tokio::test]
    async fn unrelated_message_computes_nothing() {
        let (engine, _) = make_engine(vec![make_vp(100, "raw_val * 2", &[(1, "raw_val")])]).await;
        let msg = DeviceDataMessage::new(7, 1, vec![TimestampedValue::new(99, 1.0)]);
        assert!(engine.calculate_for_message(&msg).is_empty());
    }

    #[tokio::test]
    async fn missing_dependency_falls_back_to_cache() {
        let (engine, cache) =
            make_engine(vec![make_vp(100, "a + b", &[(1, "a"), (2, "b")])]).await;
        cache.update_point_state(2, &Value::Float(10.0));

        let msg = DeviceDataMessage::new(7, 1, vec![TimestampedValue::new(1, 5.0)]);
        let results = engine.calculate_for_message(&msg);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].value, Value::Float(15.0));
    }

    #[tokio::test]
    async fn failing_formula_skips_point_only() {
        let (engine, _) = make_engine(vec![
            make_vp(100, "bad ~~ formula", &[(1, "x")]),
            make_vp(101, "x + 1", &[(1, "x")]),
        ])
        .await;

        let msg = DeviceDataMessage::new(7, 1, vec![TimestampedValue::new(1, 5.0)]);
        let results = engine.calculate_for_message(&msg);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].point_id, 101);
    }
}
