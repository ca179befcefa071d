//! Gateway dependency context
//!
//! Explicit construction-time wiring: the service owns the context, the
//! context owns the registry/runner/clients, children hold shared handles.
//! No global lookups on hot paths.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::storage::{EdgeServerRepository, RedisSink};

use super::registry::TargetRegistry;
use super::runner::TargetRunner;

pub struct GatewayContext {
    pub gateway_id: i64,
    tenant_id: AtomicI32,
    pub registry: Arc<TargetRegistry>,
    pub runner: Arc<TargetRunner>,
    pub redis: Arc<dyn RedisSink>,
    pub edge_servers: Arc<dyn EdgeServerRepository>,
}

impl GatewayContext {
    pub fn new(
        gateway_id: i64,
        registry: Arc<TargetRegistry>,
        runner: Arc<TargetRunner>,
        redis: Arc<dyn RedisSink>,
        edge_servers: Arc<dyn EdgeServerRepository>,
    ) -> Self {
        Self {
            gateway_id,
            tenant_id: AtomicI32::new(0),
            registry,
            runner,
            redis,
            edge_servers,
        }
    }

    pub fn set_tenant_id(&self, tenant_id: i32) {
        self.tenant_id.store(tenant_id, Ordering::Relaxed);
    }

    pub fn tenant_id(&self) -> i32 {
        self.tenant_id.load(Ordering::Relaxed)
    }
}
