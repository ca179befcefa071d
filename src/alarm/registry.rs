//! Alarm rule registry
//!
//! Loads rules per tenant from the repository and keeps a
//! `(tenant, point) → rules` index so the hot path is a map lookup plus a
//! vector copy. Reloads rebuild both tables under the exclusive lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{error, info};

use crate::storage::AlarmRuleRepository;
use crate::types::AlarmRule;

#[derive(Default)]
struct RegistryInner {
    /// tenant → rules as loaded
    tenant_rules: HashMap<i32, Vec<AlarmRule>>,
    /// (tenant, point) → indices into the tenant's rule vector
    point_index: HashMap<(i32, i64), Vec<usize>>,
}

pub struct AlarmRuleRegistry {
    repository: Arc<dyn AlarmRuleRepository>,
    inner: RwLock<RegistryInner>,
}

impl AlarmRuleRegistry {
    pub fn new(repository: Arc<dyn AlarmRuleRepository>) -> Self {
        Self {
            repository,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Load (or reload) the rule set for a tenant.
    ///
    /// Disabled rules are kept in the tenant table but left out of the
    /// point index, so they never reach the evaluator.
    pub async fn load_rules(&self, tenant_id: i32) {
        let rules = match self.repository.find_by_tenant(tenant_id).await {
            Ok(rules) => rules,
            Err(e) => {
                error!(tenant_id, error = %e, "Failed to load alarm rules");
                return;
            }
        };

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .point_index
            .retain(|(tenant, _), _| *tenant != tenant_id);
        for (idx, rule) in rules.iter().enumerate() {
            if !rule.enabled {
                continue;
            }
            if let Some(target_id) = rule.target_id {
                inner
                    .point_index
                    .entry((tenant_id, target_id))
                    .or_default()
                    .push(idx);
            }
        }
        let count = rules.len();
        inner.tenant_rules.insert(tenant_id, rules);
        drop(inner);

        info!(tenant_id, rules = count, "Alarm rules loaded");
    }

    /// Rules watching a specific point. Constant-time lookup plus copy.
    pub fn rules_for_point(&self, tenant_id: i32, point_id: i64) -> Vec<AlarmRule> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(indices) = inner.point_index.get(&(tenant_id, point_id)) else {
            return Vec::new();
        };
        let Some(rules) = inner.tenant_rules.get(&tenant_id) else {
            return Vec::new();
        };
        indices.iter().filter_map(|&i| rules.get(i).cloned()).collect()
    }

    pub fn all_rules(&self, tenant_id: i32) -> Vec<AlarmRule> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .tenant_rules
            .get(&tenant_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_tenant_loaded(&self, tenant_id: i32) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .tenant_rules
            .contains_key(&tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAlarmRuleRepository;
    use crate::types::{AlarmSeverity, AlarmTargetType, AlarmType};

    fn make_rule(id: i64, tenant_id: i32, point_id: i64, enabled: bool) -> AlarmRule {
        AlarmRule {
            id,
            tenant_id,
            target_type: AlarmTargetType::DataPoint,
            target_id: Some(point_id),
            alarm_type: AlarmType::Analog,
            high_high: None,
            high: Some(100.0),
            low: None,
            low_low: None,
            condition_script: None,
            severity: AlarmSeverity::High,
            enabled,
        }
    }

    #[tokio::test]
    async fn indexes_enabled_rules_by_point() {
        let repo = Arc::new(MemoryAlarmRuleRepository::new(vec![
            make_rule(1, 1, 10, true),
            make_rule(2, 1, 10, true),
            make_rule(3, 1, 20, true),
            make_rule(4, 1, 10, false), // disabled — indexed nowhere
        ]));
        let registry = AlarmRuleRegistry::new(repo);
        registry.load_rules(1).await;

        assert!(registry.is_tenant_loaded(1));
        let rules = registry.rules_for_point(1, 10);
        assert_eq!(rules.len(), 2);
        assert_eq!(registry.rules_for_point(1, 20).len(), 1);
        assert!(registry.rules_for_point(1, 99).is_empty());
        assert!(registry.rules_for_point(2, 10).is_empty());
    }

    #[tokio::test]
    async fn reload_replaces_index() {
        let repo = Arc::new(MemoryAlarmRuleRepository::new(vec![make_rule(1, 1, 10, true)]));
        let registry = AlarmRuleRegistry::new(Arc::clone(&repo) as Arc<dyn AlarmRuleRepository>);
        registry.load_rules(1).await;
        assert_eq!(registry.rules_for_point(1, 10).len(), 1);

        repo.replace(vec![make_rule(5, 1, 30, true)]);
        registry.load_rules(1).await;
        assert!(registry.rules_for_point(1, 10).is_empty());
        assert_eq!(registry.rules_for_point(1, 30).len(), 1);
    }
}
