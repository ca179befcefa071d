//! Target handlers
//!
//! One implementation per sink type (HTTP, S3, FILE, MQTT), all behind the
//! [`TargetHandler`] contract. The factory maps type names to constructors
//! so the registry can build handler instances straight from target rows.

mod file;
mod http;
mod mqtt;
mod s3;

pub use file::FileTargetHandler;
pub use http::HttpTargetHandler;
pub use mqtt::MqttTargetHandler;
pub use s3::S3TargetHandler;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::types::{CspAlarmMessage, CspValueMessage, TargetSendResult};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("io error: {0}")]
    Io(String),
}

/// Common contract for every export sink.
///
/// `send_*` never panics and never returns `Err` — failures are carried in
/// the result so the runner can record them against the failure protector.
#[async_trait]
pub trait TargetHandler: Send + Sync {
    fn handler_type(&self) -> &'static str;

    /// One-time setup from the target's config bag (connections, tasks).
    async fn initialize(&self, _config: &serde_json::Value) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn send_alarm(
        &self,
        alarm: &CspAlarmMessage,
        config: &serde_json::Value,
    ) -> TargetSendResult;

    async fn send_value(
        &self,
        value: &CspValueMessage,
        config: &serde_json::Value,
    ) -> TargetSendResult;

    /// Optional file transfer; most handlers do not support it.
    async fn send_file(&self, _local_path: &Path, _config: &serde_json::Value) -> TargetSendResult {
        TargetSendResult {
            error_message: "File export not supported by this handler".to_string(),
            target_type: self.handler_type().to_string(),
            ..TargetSendResult::default()
        }
    }

    async fn test_connection(&self, config: &serde_json::Value) -> bool;

    /// Collect configuration errors; an empty list means the target may run.
    fn validate_config(&self, config: &serde_json::Value) -> Vec<String>;

    fn status(&self) -> serde_json::Value {
        json!({ "type": self.handler_type(), "status": "active" })
    }

    async fn cleanup(&self) {}

    async fn send_alarm_batch(
        &self,
        alarms: &[CspAlarmMessage],
        config: &serde_json::Value,
    ) -> Vec<TargetSendResult> {
        let mut results = Vec::with_capacity(alarms.len());
        for alarm in alarms {
            results.push(self.send_alarm(alarm, config).await);
        }
        results
    }

    async fn send_value_batch(
        &self,
        values: &[CspValueMessage],
        config: &serde_json::Value,
    ) -> Vec<TargetSendResult> {
        let mut results = Vec::with_capacity(values.len());
        for value in values {
            results.push(self.send_value(value, config).await);
        }
        results
    }
}

type HandlerCreator = Box<dyn Fn() -> Arc<dyn TargetHandler> + Send + Sync>;

/// Type-name → constructor registry, populated at startup.
pub struct TargetHandlerFactory {
    creators: RwLock<HashMap<String, HandlerCreator>>,
}

impl TargetHandlerFactory {
    pub fn new() -> Self {
        Self {
            creators: RwLock::new(HashMap::new()),
        }
    }

    /// Factory with the four built-in handler types registered.
    pub fn with_builtin_handlers() -> Self {
        let factory = Self::new();
        factory.register("HTTP", || Arc::new(HttpTargetHandler::new()));
        factory.register("S3", || Arc::new(S3TargetHandler::new()));
        factory.register("FILE", || Arc::new(FileTargetHandler::new()));
        factory.register("MQTT", || Arc::new(MqttTargetHandler::new()));
        factory
    }

    pub fn register<F>(&self, type_name: &str, creator: F)
    where
        F: Fn() -> Arc<dyn TargetHandler> + Send + Sync + 'static,
    {
        self.creators
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(type_name.to_ascii_uppercase(), Box::new(creator));
    }

    pub fn create(&self, type_name: &str) -> Option<Arc<dyn TargetHandler>> {
        self.creators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&type_name.to_ascii_uppercase())
            .map(|creator| creator())
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .creators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

impl Default for TargetHandlerFactory {
    fn default() -> Self {
        Self::with_builtin_handlers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_types_registered() {
        let factory = TargetHandlerFactory::with_builtin_handlers();
        assert_eq!(factory.registered_types(), vec!["FILE", "HTTP", "MQTT", "S3"]);
        assert!(factory.create("http").is_some());
        assert!(factory.create("SFTP").is_none());
    }
}
