//! Target runner
//!
//! Drives one alarm (or batch) across the enabled targets: applies
//! per-target mappings, consults the target's failure protector, honors
//! the pre-send delay, invokes the handler, and records the outcome into
//! the protector and the gateway statistics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::types::{BatchTargetResult, CspAlarmMessage, CspValueMessage, DynamicTarget, TargetSendResult};

use super::protector::{FailureProtector, ProtectorConfig};
use super::registry::TargetRegistry;

/// Export modes a target may declare; anything else is skipped for alarms.
const EXPORT_MODES: &[&str] = &["ALARM", "EVENT", "REALTIME", "BATCH"];

/// Cumulative gateway export statistics.
#[derive(Debug, Clone, Default)]
pub struct GatewayStats {
    pub total_exports: u64,
    pub successful_exports: u64,
    pub failed_exports: u64,
    pub alarm_exports: u64,
    pub value_exports: u64,
    pub avg_response_time_ms: f64,
    pub last_export_time: Option<DateTime<Utc>>,
    pub per_type: HashMap<String, u64>,
}

pub struct TargetRunner {
    registry: Arc<TargetRegistry>,
    protectors: Mutex<HashMap<String, Arc<FailureProtector>>>,
    stats: Mutex<GatewayStats>,
}

impl TargetRunner {
    pub fn new(registry: Arc<TargetRegistry>) -> Self {
        info!("Target runner initialized");
        Self {
            registry,
            protectors: Mutex::new(HashMap::new()),
            stats: Mutex::new(GatewayStats::default()),
        }
    }

    /// Send one alarm to every enabled target whose export mode accepts it.
    pub async fn send_alarm(&self, alarm: &CspAlarmMessage) -> Vec<TargetSendResult> {
        let mut results = Vec::new();
        for target in self.registry.all_targets() {
            if !target.enabled {
                continue;
            }
            let mode = target
                .config
                .get("export_mode")
                .and_then(|v| v.as_str())
                .unwrap_or("ALARM")
                .to_ascii_uppercase();
            if !EXPORT_MODES.contains(&mode.as_str()) {
                continue;
            }
            results.push(self.send_alarm_to_target(&target.name, alarm).await);
        }
        results
    }

    /// Send one alarm to a named target, through its failure protector.
    pub async fn send_alarm_to_target(
        &self,
        target_name: &str,
        alarm: &CspAlarmMessage,
    ) -> TargetSendResult {
        let Some(target) = self.registry.get_target(target_name) else {
            return TargetSendResult::failure(target_name, format!("Target not found: {}", target_name));
        };

        let protector = self.protector_for(&target);
        if !protector.can_execute() {
            let mut result = TargetSendResult::failure(target_name, "Circuit breaker open");
            result.target_id = target.id;
            result.target_type = target.target_type.as_str().to_string();
            self.update_stats(&result, true);
            return result;
        }

        if target.execution_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(target.execution_delay_ms)).await;
        }

        let processed = self.apply_mappings(&target, alarm);

        let start = Instant::now();
        let mut result = match self.registry.handler(&target.name) {
            Some(handler) => handler.send_alarm(&processed, &target.config).await,
            None => TargetSendResult::failure(
                target_name,
                format!("Handler not found for target: {}", target_name),
            ),
        };
        result.response_time_ms = start.elapsed().as_millis() as u64;
        result.target_id = target.id;
        result.target_name = target.name.clone();
        result.target_type = target.target_type.as_str().to_string();

        if result.success {
            protector.record_success();
        } else {
            protector.record_failure();
        }
        self.update_stats(&result, true);

        debug!(
            target = %target.name,
            success = result.success,
            elapsed_ms = result.response_time_ms,
            "Alarm export finished"
        );
        result
    }

    /// Send one sampled value to a named target.
    pub async fn send_value_to_target(
        &self,
        target_name: &str,
        value: &CspValueMessage,
    ) -> TargetSendResult {
        let Some(target) = self.registry.get_target(target_name) else {
            return TargetSendResult::failure(target_name, format!("Target not found: {}", target_name));
        };

        let protector = self.protector_for(&target);
        if !protector.can_execute() {
            let mut result = TargetSendResult::failure(target_name, "Circuit breaker open");
            result.target_id = target.id;
            result.target_type = target.target_type.as_str().to_string();
            self.update_stats(&result, false);
            return result;
        }

        let processed = self.apply_value_mappings(&target, value);
        let mut result = match self.registry.handler(&target.name) {
            Some(handler) => handler.send_value(&processed, &target.config).await,
            None => TargetSendResult::failure(
                target_name,
                format!("Handler not found for target: {}", target_name),
            ),
        };
        result.target_id = target.id;
        result.target_name = target.name.clone();
        result.target_type = target.target_type.as_str().to_string();

        if result.success {
            protector.record_success();
        } else {
            protector.record_failure();
        }
        self.update_stats(&result, false);
        result
    }

    /// Batch send, delegating to the handlers' batch entry points.
    /// An empty `specific_target` fans out to every enabled target.
    pub async fn send_alarm_batch(
        &self,
        alarms: &[CspAlarmMessage],
        specific_target: &str,
    ) -> BatchTargetResult {
        let mut batch = BatchTargetResult::default();
        for target in self.registry.all_targets() {
            if !target.enabled {
                continue;
            }
            if !specific_target.is_empty() && target.name != specific_target {
                continue;
            }
            let Some(handler) = self.registry.handler(&target.name) else {
                continue;
            };

            let processed: Vec<CspAlarmMessage> = alarms
                .iter()
                .map(|alarm| self.apply_mappings(&target, alarm))
                .collect();
            for mut result in handler.send_alarm_batch(&processed, &target.config).await {
                result.target_id = target.id;
                result.target_name = target.name.clone();
                result.target_type = target.target_type.as_str().to_string();
                batch.push(result);
            }
        }
        batch
    }

    pub async fn send_value_batch(
        &self,
        values: &[CspValueMessage],
        specific_target: &str,
    ) -> BatchTargetResult {
        let mut batch = BatchTargetResult::default();
        for target in self.registry.all_targets() {
            if !target.enabled {
                continue;
            }
            if !specific_target.is_empty() && target.name != specific_target {
                continue;
            }
            let Some(handler) = self.registry.handler(&target.name) else {
                continue;
            };
            let processed: Vec<CspValueMessage> = values
                .iter()
                .map(|value| self.apply_value_mappings(&target, value))
                .collect();
            for mut result in handler.send_value_batch(&processed, &target.config).await {
                result.target_id = target.id;
                result.target_name = target.name.clone();
                result.target_type = target.target_type.as_str().to_string();
                batch.push(result);
            }
        }
        batch
    }

    /// Apply the registry's mappings to produce the per-target alarm copy:
    /// field-name mapping, site override, external building id, and
    /// scale/offset on the numeric value.
    fn apply_mappings(&self, target: &DynamicTarget, alarm: &CspAlarmMessage) -> CspAlarmMessage {
        let mut processed = alarm.clone();

        if let Some(field) = self.registry.field_name(target.id, alarm.point_id) {
            if !field.is_empty() {
                processed.nm = field;
            }
        }

        let site_id = self
            .registry
            .override_site_id(target.id, alarm.point_id)
            .unwrap_or(alarm.site_id);
        match self.registry.external_building_id(target.id, site_id) {
            Some(external) => {
                if let Ok(bd) = external.parse() {
                    processed.bd = bd;
                }
            }
            None => {
                if site_id != alarm.site_id {
                    processed.bd = site_id;
                }
            }
        }
        processed.site_id = site_id;

        let (scale, offset) = self.registry.scaling(target.id, alarm.point_id);
        processed.vl = alarm.vl * scale + offset;
        processed
    }

    fn apply_value_mappings(
        &self,
        target: &DynamicTarget,
        value: &CspValueMessage,
    ) -> CspValueMessage {
        let mut processed = value.clone();
        if let Some(field) = self.registry.field_name(target.id, value.point_id) {
            if !field.is_empty() {
                processed.nm = field;
            }
        }
        let (scale, offset) = self.registry.scaling(target.id, value.point_id);
        processed.vl = value.vl * scale + offset;
        processed
    }

    fn protector_for(&self, target: &DynamicTarget) -> Arc<FailureProtector> {
        let mut protectors = self.protectors.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(protectors.entry(target.name.clone()).or_insert_with(|| {
            Arc::new(FailureProtector::new(
                target.name.clone(),
                ProtectorConfig::from_target_config(&target.config),
            ))
        }))
    }

    /// Admin override: reset one target's protector.
    pub fn reset_protector(&self, target_name: &str) {
        if let Some(protector) = self
            .protectors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target_name)
        {
            protector.reset();
        }
    }

    /// Admin override: reset every protector.
    pub fn reset_all_protectors(&self) {
        for protector in self
            .protectors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            protector.reset();
        }
    }

    pub fn protector_statistics(&self) -> serde_json::Value {
        let protectors = self.protectors.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = serde_json::Map::new();
        for (name, protector) in protectors.iter() {
            out.insert(name.clone(), protector.statistics().to_json());
        }
        json!(out)
    }

    pub fn stats(&self) -> GatewayStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = GatewayStats::default();
    }

    fn update_stats(&self, result: &TargetSendResult, is_alarm: bool) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.total_exports += 1;
        if result.success {
            stats.successful_exports += 1;
        } else {
            stats.failed_exports += 1;
        }
        if is_alarm {
            stats.alarm_exports += 1;
        } else {
            stats.value_exports += 1;
        }
        if !result.target_type.is_empty() {
            *stats.per_type.entry(result.target_type.clone()).or_insert(0) += 1;
        }
        stats.last_export_time = Some(Utc::now());

        let n = stats.total_exports as f64;
        stats.avg_response_time_ms =
            (stats.avg_response_time_ms * (n - 1.0) + result.response_time_ms as f64) / n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::handlers::TargetHandlerFactory;
    use crate::storage::{
        MemoryTargetRepository, SiteMappingRow, TargetLoadData, TargetMappingRow,
    };
    use crate::types::TargetType;
    use serde_json::json;

    async fn runner_with_file_target(base: &std::path::Path) -> TargetRunner {
        let data = TargetLoadData {
            targets: vec![DynamicTarget {
                id: 1,
                name: "file_a".to_string(),
                target_type: TargetType::File,
                enabled: true,
                execution_order: 1,
                execution_delay_ms: 0,
                priority: 0,
                config: json!({
                    "base_path": base.to_str().unwrap(),
                    "file_format": "txt",
                    "filename_template": "out.log",
                    "append_mode": true,
                }),
                description: String::new(),
            }],
            point_mappings: vec![TargetMappingRow {
                target_id: 1,
                point_id: 7,
                field_name: "temp_f".to_string(),
                override_site_id: Some(5),
                scale: 2.0,
                offset: 10.0,
            }],
            site_mappings: vec![SiteMappingRow {
                target_id: 1,
                site_id: 5,
                external_building_id: "900".to_string(),
            }],
            ..TargetLoadData::default()
        };
        let registry = Arc::new(TargetRegistry::new(
            Arc::new(MemoryTargetRepository::new(data)),
            TargetHandlerFactory::with_builtin_handlers(),
        ));
        registry.load(1).await;
        TargetRunner::new(registry)
    }

    fn alarm(point_id: i64) -> CspAlarmMessage {
        let mut alarm = CspAlarmMessage::sample(101, "temp_c", 50.0, true);
        alarm.point_id = point_id;
        alarm.site_id = 101;
        alarm
    }

    #[tokio::test]
    async fn mappings_rewrite_name_building_and_value() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_with_file_target(tmp.path()).await;

        let results = runner.send_alarm(&alarm(7)).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].success, "{}", results[0].error_message);

        let content = std::fs::read_to_string(tmp.path().join("out.log")).unwrap();
        // nm mapped, bd from external building id, vl scaled 50*2+10
        assert!(content.contains("point=temp_f"));
        assert!(content.contains("building=900"));
        assert!(content.contains("value=110"));
    }

    #[tokio::test]
    async fn unmapped_point_passes_through() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_with_file_target(tmp.path()).await;

        let results = runner.send_alarm(&alarm(99)).await;
        assert!(results[0].success);
        let content = std::fs::read_to_string(tmp.path().join("out.log")).unwrap();
        assert!(content.contains("point=temp_c"));
        assert!(content.contains("building=101"));
        assert!(content.contains("value=50"));
    }

    #[tokio::test]
    async fn open_breaker_blocks_send_without_handler_call() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_with_file_target(tmp.path()).await;

        // Trip the breaker by hand
        let target = runner.registry.get_target("file_a").unwrap();
        runner.protector_for(&target).force_open();

        let result = runner.send_alarm_to_target("file_a", &alarm(7)).await;
        assert!(!result.success);
        assert_eq!(result.error_message, "Circuit breaker open");
        assert!(!tmp.path().join("out.log").exists());

        runner.reset_protector("file_a");
        let result = runner.send_alarm_to_target("file_a", &alarm(7)).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn stats_accumulate() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_with_file_target(tmp.path()).await;
        runner.send_alarm(&alarm(7)).await;
        runner.send_alarm(&alarm(7)).await;

        let stats = runner.stats();
        assert_eq!(stats.total_exports, 2);
        assert_eq!(stats.successful_exports, 2);
        assert_eq!(stats.alarm_exports, 2);
        assert_eq!(stats.per_type["FILE"], 2);
    }

    #[tokio::test]
    async fn unknown_target_reports_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_with_file_target(tmp.path()).await;
        let result = runner.send_alarm_to_target("ghost", &alarm(7)).await;
        assert!(!result.success);
        assert!(result.error_message.contains("Target not found"));
    }
}
