//! Target registry
//!
//! Assembles `DynamicTarget`s from the repository: merges payload
//! templates into the config bags, applies gateway-scoped priority
//! overrides, validates each target against its handler, and materializes
//! the mapping caches. The whole result is one immutable snapshot swapped
//! atomically on reload — in-flight sends keep the handler instances they
//! already hold.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::{error, info, warn};

use crate::storage::{TargetLoadData, TargetRepository};
use crate::types::DynamicTarget;

use super::handlers::{TargetHandler, TargetHandlerFactory};

#[derive(Default)]
pub struct RegistrySnapshot {
    /// Sorted by `(execution_order, priority)`.
    targets: Vec<DynamicTarget>,
    by_name: HashMap<String, usize>,
    handlers: HashMap<String, Arc<dyn TargetHandler>>,
    point_field: HashMap<(i64, i64), String>,
    point_site: HashMap<(i64, i64), i32>,
    site_building: HashMap<(i64, i32), String>,
    scaling: HashMap<(i64, i64), (f64, f64)>,
    assigned_point_ids: HashSet<i64>,
}

pub struct TargetRegistry {
    repository: Arc<dyn TargetRepository>,
    factory: TargetHandlerFactory,
    priority_overrides: Mutex<HashMap<i64, i32>>,
    snapshot: ArcSwap<RegistrySnapshot>,
}

impl TargetRegistry {
    pub fn new(repository: Arc<dyn TargetRepository>, factory: TargetHandlerFactory) -> Self {
        Self {
            repository,
            factory,
            priority_overrides: Mutex::new(HashMap::new()),
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
        }
    }

    /// Gateway-scoped execution-order overrides, applied at the next load.
    pub fn set_target_priorities(&self, priorities: HashMap<i64, i32>) {
        *self
            .priority_overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = priorities;
    }

    /// Build a fresh snapshot from the repository and swap it in.
    pub async fn load(&self, gateway_id: i64) -> bool {
        let data = match self.repository.load(gateway_id).await {
            Ok(data) => data,
            Err(e) => {
                error!(gateway_id, error = %e, "Target registry load failed");
                return false;
            }
        };

        let snapshot = self.build_snapshot(data).await;
        let target_count = snapshot.targets.len();
        self.snapshot.store(Arc::new(snapshot));
        info!(gateway_id, targets = target_count, "Target registry loaded");
        true
    }

    async fn build_snapshot(&self, data: TargetLoadData) -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot::default();

        let templates: HashMap<i64, &serde_json::Value> = data
            .templates
            .iter()
            .map(|t| (t.id, &t.body))
            .collect();
        let overrides = self
            .priority_overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for mapping in &data.point_mappings {
            let key = (mapping.target_id, mapping.point_id);
            snapshot
                .point_field
                .insert(key, mapping.field_name.clone());
            if let Some(site_id) = mapping.override_site_id {
                snapshot.point_site.insert(key, site_id);
            }
            snapshot
                .scaling
                .insert(key, (mapping.scale, mapping.offset));
        }
        for mapping in &data.site_mappings {
            snapshot.site_building.insert(
                (mapping.target_id, mapping.site_id),
                mapping.external_building_id.clone(),
            );
        }
        snapshot.assigned_point_ids = data.assigned_point_ids.iter().copied().collect();

        let mut targets = Vec::new();
        for mut target in data.targets {
            if let Some(order) = overrides.get(&target.id) {
                target.execution_order = *order;
            }

            // Merge the assigned payload template into the config bag
            // without clobbering explicit target settings.
            if let Some(template_id) = data.template_assignments.get(&target.id) {
                if let Some(template) = templates.get(template_id) {
                    if let (Some(config), Some(body)) =
                        (target.config.as_object_mut(), template.as_object())
                    {
                        for (name, value) in body {
                            config.entry(name.clone()).or_insert_with(|| value.clone());
                        }
                    }
                }
            }

            let Some(handler) = self.factory.create(target.target_type.as_str()) else {
                warn!(target = %target.name, kind = target.target_type.as_str(), "No handler for target type");
                continue;
            };

            let errors = handler.validate_config(&target.config);
            if !errors.is_empty() {
                error!(
                    target = %target.name,
                    errors = ?errors,
                    "Target config invalid — target disabled"
                );
                continue;
            }

            if target.enabled {
                if let Err(e) = handler.initialize(&target.config).await {
                    warn!(target = %target.name, error = %e, "Handler initialization failed");
                }
            }

            snapshot.handlers.insert(target.name.clone(), handler);
            targets.push(target);
        }

        targets.sort_by_key(|t| (t.execution_order, t.priority));
        for (index, target) in targets.iter().enumerate() {
            snapshot.by_name.insert(target.name.clone(), index);
        }
        snapshot.targets = targets;
        snapshot
    }

    pub fn get_target(&self, name: &str) -> Option<DynamicTarget> {
        let snapshot = self.snapshot.load();
        snapshot
            .by_name
            .get(name)
            .and_then(|&i| snapshot.targets.get(i))
            .cloned()
    }

    pub fn all_targets(&self) -> Vec<DynamicTarget> {
        self.snapshot.load().targets.clone()
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn TargetHandler>> {
        self.snapshot.load().handlers.get(name).cloned()
    }

    /// Mapped field name for a point on a target.
    pub fn field_name(&self, target_id: i64, point_id: i64) -> Option<String> {
        self.snapshot
            .load()
            .point_field
            .get(&(target_id, point_id))
            .cloned()
    }

    pub fn is_point_mapped(&self, target_id: i64, point_id: i64) -> bool {
        self.snapshot
            .load()
            .point_field
            .contains_key(&(target_id, point_id))
    }

    pub fn override_site_id(&self, target_id: i64, point_id: i64) -> Option<i32> {
        self.snapshot
            .load()
            .point_site
            .get(&(target_id, point_id))
            .copied()
    }

    pub fn external_building_id(&self, target_id: i64, site_id: i32) -> Option<String> {
        self.snapshot
            .load()
            .site_building
            .get(&(target_id, site_id))
            .cloned()
    }

    /// `(scale, offset)` for a point on a target; identity when unmapped.
    pub fn scaling(&self, target_id: i64, point_id: i64) -> (f64, f64) {
        self.snapshot
            .load()
            .scaling
            .get(&(target_id, point_id))
            .copied()
            .unwrap_or((1.0, 0.0))
    }

    pub fn assigned_point_ids(&self) -> HashSet<i64> {
        self.snapshot.load().assigned_point_ids.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        MemoryTargetRepository, PayloadTemplateRow, SiteMappingRow, TargetMappingRow,
    };
    use crate::types::TargetType;
    use serde_json::json;

    fn file_target(id: i64, name: &str, order: i32) -> DynamicTarget {
        DynamicTarget {
            id,
            name: name.to_string(),
            target_type: TargetType::File,
            enabled: true,
            execution_order: order,
            execution_delay_ms: 0,
            priority: 0,
            config: json!({"base_path": "/tmp/pulseone-test"}),
            description: String::new(),
        }
    }

    fn load_data() -> TargetLoadData {
        TargetLoadData {
            targets: vec![file_target(1, "file_b", 2), file_target(2, "file_a", 1)],
            template_assignments: HashMap::from([(1, 10)]),
            templates: vec![PayloadTemplateRow {
                id: 10,
                body: json!({"file_format": "csv"}),
            }],
            point_mappings: vec![TargetMappingRow {
                target_id: 1,
                point_id: 7,
                field_name: "temp_f".to_string(),
                override_site_id: Some(5),
                scale: 1.8,
                offset: 32.0,
            }],
            site_mappings: vec![SiteMappingRow {
                target_id: 1,
                site_id: 5,
                external_building_id: "900".to_string(),
            }],
            assigned_point_ids: vec![7, 8],
        }
    }

    fn registry(data: TargetLoadData) -> TargetRegistry {
        TargetRegistry::new(
            Arc::new(MemoryTargetRepository::new(data)),
            TargetHandlerFactory::with_builtin_handlers(),
        )
    }

    #[tokio::test]
    async fn loads_sorts_and_indexes() {
        let registry = registry(load_data());
        assert!(registry.load(1).await);

        let targets = registry.all_targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "file_a"); // execution_order 1 first
        assert!(registry.handler("file_b").is_some());
        assert!(registry.get_target("missing").is_none());
    }

    #[tokio::test]
    async fn template_merged_without_clobbering() {
        let registry = registry(load_data());
        registry.load(1).await;
        let target = registry.get_target("file_b").unwrap();
        assert_eq!(target.config["file_format"], "csv"); // from template
        assert_eq!(target.config["base_path"], "/tmp/pulseone-test"); // kept
    }

    #[tokio::test]
    async fn mapping_lookups() {
        let registry = registry(load_data());
        registry.load(1).await;

        assert_eq!(registry.field_name(1, 7).unwrap(), "temp_f");
        assert!(registry.is_point_mapped(1, 7));
        assert!(!registry.is_point_mapped(1, 99));
        assert_eq!(registry.override_site_id(1, 7), Some(5));
        assert_eq!(registry.external_building_id(1, 5).unwrap(), "900");
        assert_eq!(registry.scaling(1, 7), (1.8, 32.0));
        assert_eq!(registry.scaling(1, 99), (1.0, 0.0));
        assert_eq!(registry.assigned_point_ids().len(), 2);
    }

    #[tokio::test]
    async fn priority_override_applies_on_load() {
        let registry = registry(load_data());
        registry.set_target_priorities(HashMap::from([(1, 0)]));
        registry.load(1).await;
        let targets = registry.all_targets();
        assert_eq!(targets[0].name, "file_b"); // overridden to order 0
    }

    #[tokio::test]
    async fn invalid_config_drops_target() {
        let mut data = load_data();
        data.targets.push(DynamicTarget {
            id: 3,
            name: "bad_http".to_string(),
            target_type: TargetType::Http,
            enabled: true,
            execution_order: 0,
            execution_delay_ms: 0,
            priority: 0,
            config: json!({}), // missing url
            description: String::new(),
        });
        let registry = registry(data);
        registry.load(1).await;
        assert!(registry.get_target("bad_http").is_none());
        assert_eq!(registry.all_targets().len(), 2);
    }
}
