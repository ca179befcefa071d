//! Repository seams over the RDB
//!
//! Concrete SQL lives outside this crate; these traits are the contract the
//! pipeline and gateway code against. The in-memory implementations back
//! tests and standalone runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{
    AlarmOccurrence, AlarmRule, AlarmState, DynamicTarget, TimestampedValue, VirtualPoint,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Alarm rule lookup, scoped by tenant.
#[async_trait]
pub trait AlarmRuleRepository: Send + Sync {
    async fn find_by_tenant(&self, tenant_id: i32) -> Result<Vec<AlarmRule>, RepositoryError>;
}

/// Alarm occurrence lifecycle persistence.
#[async_trait]
pub trait AlarmOccurrenceRepository: Send + Sync {
    /// Insert a new occurrence; returns the issued id.
    async fn insert(&self, occurrence: &AlarmOccurrence) -> Result<i64, RepositoryError>;

    /// Update the state of an existing occurrence.
    async fn update_state(&self, id: i64, state: AlarmState) -> Result<(), RepositoryError>;

    /// Occurrences with `state = ACTIVE` and no acknowledgement, for
    /// startup recovery.
    async fn find_active(&self) -> Result<Vec<AlarmOccurrence>, RepositoryError>;
}

/// Virtual point definitions per tenant.
#[async_trait]
pub trait VirtualPointRepository: Send + Sync {
    async fn find_enabled(&self, tenant_id: i32) -> Result<Vec<VirtualPoint>, RepositoryError>;
}

/// Latest persisted point values, for warm startup recovery.
#[async_trait]
pub trait CurrentValueRepository: Send + Sync {
    async fn latest_values(&self) -> Result<Vec<TimestampedValue>, RepositoryError>;
}

/// Mapping row: point → target field name, optional site override and scaling.
#[derive(Debug, Clone)]
pub struct TargetMappingRow {
    pub target_id: i64,
    pub point_id: i64,
    pub field_name: String,
    pub override_site_id: Option<i32>,
    pub scale: f64,
    pub offset: f64,
}

impl Default for TargetMappingRow {
    fn default() -> Self {
        Self {
            target_id: 0,
            point_id: 0,
            field_name: String::new(),
            override_site_id: None,
            scale: 1.0,
            offset: 0.0,
        }
    }
}

/// Mapping row: internal site → external building id.
#[derive(Debug, Clone)]
pub struct SiteMappingRow {
    pub target_id: i64,
    pub site_id: i32,
    pub external_building_id: String,
}

/// Payload template merged into a target's config at load time.
#[derive(Debug, Clone)]
pub struct PayloadTemplateRow {
    pub id: i64,
    pub body: serde_json::Value,
}

/// Everything the target registry needs in one load.
#[derive(Debug, Clone, Default)]
pub struct TargetLoadData {
    pub targets: Vec<DynamicTarget>,
    /// target id → payload template id
    pub template_assignments: HashMap<i64, i64>,
    pub templates: Vec<PayloadTemplateRow>,
    pub point_mappings: Vec<TargetMappingRow>,
    pub site_mappings: Vec<SiteMappingRow>,
    /// Point ids assigned to this gateway, for selective subscription.
    pub assigned_point_ids: Vec<i64>,
}

/// Export target configuration, scoped by gateway.
#[async_trait]
pub trait TargetRepository: Send + Sync {
    async fn load(&self, gateway_id: i64) -> Result<TargetLoadData, RepositoryError>;
}

/// The gateway's own row in `edge_servers`.
#[derive(Debug, Clone)]
pub struct EdgeServer {
    pub id: i64,
    pub tenant_id: i32,
    /// "selective" or "all"
    pub subscription_mode: String,
    /// Free-form config JSON; may carry `target_priorities`.
    pub config: serde_json::Value,
    pub last_seen: Option<DateTime<Utc>>,
    pub status: String,
}

#[async_trait]
pub trait EdgeServerRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<EdgeServer>, RepositoryError>;

    /// Heartbeat: `last_seen = now, status = 'active'`.
    async fn touch(&self, id: i64) -> Result<(), RepositoryError>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryAlarmRuleRepository {
    rules: Mutex<Vec<AlarmRule>>,
}

impl MemoryAlarmRuleRepository {
    pub fn new(rules: Vec<AlarmRule>) -> Self {
        Self {
            rules: Mutex::new(rules),
        }
    }

    pub fn replace(&self, rules: Vec<AlarmRule>) {
        *self.rules.lock().unwrap_or_else(|e| e.into_inner()) = rules;
    }
}

#[async_trait]
impl AlarmRuleRepository for MemoryAlarmRuleRepository {
    async fn find_by_tenant(&self, tenant_id: i32) -> Result<Vec<AlarmRule>, RepositoryError> {
        Ok(self
            .rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryOccurrenceRepository {
    occurrences: Mutex<Vec<AlarmOccurrence>>,
    next_id: AtomicI64,
}

impl MemoryOccurrenceRepository {
    pub fn new() -> Self {
        Self {
            occurrences: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn with_occurrences(occurrences: Vec<AlarmOccurrence>) -> Self {
        let max_id = occurrences.iter().map(|o| o.id).max().unwrap_or(0);
        Self {
            occurrences: Mutex::new(occurrences),
            next_id: AtomicI64::new(max_id + 1),
        }
    }

    pub fn all(&self) -> Vec<AlarmOccurrence> {
        self.occurrences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl AlarmOccurrenceRepository for MemoryOccurrenceRepository {
    async fn insert(&self, occurrence: &AlarmOccurrence) -> Result<i64, RepositoryError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = occurrence.clone();
        stored.id = id;
        self.occurrences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(stored);
        Ok(id)
    }

    async fn update_state(&self, id: i64, state: AlarmState) -> Result<(), RepositoryError> {
        let mut occurrences = self.occurrences.lock().unwrap_or_else(|e| e.into_inner());
        match occurrences.iter_mut().find(|o| o.id == id) {
            Some(o) => {
                o.state = state;
                if state == AlarmState::Acknowledged {
                    o.acknowledged_time = Some(Utc::now());
                }
                Ok(())
            }
            None => Err(RepositoryError::NotFound(format!("occurrence {}", id))),
        }
    }

    async fn find_active(&self) -> Result<Vec<AlarmOccurrence>, RepositoryError> {
        Ok(self
            .occurrences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|o| o.state == AlarmState::Active && o.acknowledged_time.is_none())
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryVirtualPointRepository {
    points: Mutex<Vec<VirtualPoint>>,
}

impl MemoryVirtualPointRepository {
    pub fn new(points: Vec<VirtualPoint>) -> Self {
        Self {
            points: Mutex::new(points),
        }
    }
}

#[async_trait]
impl VirtualPointRepository for MemoryVirtualPointRepository {
    async fn find_enabled(&self, tenant_id: i32) -> Result<Vec<VirtualPoint>, RepositoryError> {
        Ok(self
            .points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|p| p.tenant_id == tenant_id && p.enabled)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryCurrentValueRepository {
    values: Mutex<Vec<TimestampedValue>>,
}

impl MemoryCurrentValueRepository {
    pub fn new(values: Vec<TimestampedValue>) -> Self {
        Self {
            values: Mutex::new(values),
        }
    }
}

#[async_trait]
impl CurrentValueRepository for MemoryCurrentValueRepository {
    async fn latest_values(&self) -> Result<Vec<TimestampedValue>, RepositoryError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

#[derive(Default)]
pub struct MemoryTargetRepository {
    data: Mutex<TargetLoadData>,
}

impl MemoryTargetRepository {
    pub fn new(data: TargetLoadData) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn replace(&self, data: TargetLoadData) {
        *self.data.lock().unwrap_or_else(|e| e.into_inner()) = data;
    }
}

#[async_trait]
impl TargetRepository for MemoryTargetRepository {
    async fn load(&self, _gateway_id: i64) -> Result<TargetLoadData, RepositoryError> {
        Ok(self.data.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

pub struct MemoryEdgeServerRepository {
    servers: Mutex<Vec<EdgeServer>>,
}

impl MemoryEdgeServerRepository {
    pub fn new(servers: Vec<EdgeServer>) -> Self {
        Self {
            servers: Mutex::new(servers),
        }
    }

    pub fn find(&self, id: i64) -> Option<EdgeServer> {
        self.servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }
}

#[async_trait]
impl EdgeServerRepository for MemoryEdgeServerRepository {
    async fn find_by_id(&self, id: i64) -> Result<Option<EdgeServer>, RepositoryError> {
        Ok(self.find(id))
    }

    async fn touch(&self, id: i64) -> Result<(), RepositoryError> {
        let mut servers = self.servers.lock().unwrap_or_else(|e| e.into_inner());
        match servers.iter_mut().find(|s| s.id == id) {
            Some(s) => {
                s.last_seen = Some(Utc::now());
                s.status = "active".to_string();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(format!("edge server {}", id))),
        }
    }
}
