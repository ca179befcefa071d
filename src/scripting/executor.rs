//! Sandboxed formula evaluator
//!
//! Contract: a formula plus a named-value input map in, one scalar out.
//! Every evaluation runs against a fresh variable context so state never
//! leaks between calls; compiled formulas are cached by content hash so
//! repeated evaluations skip the parse. Guards replace the embedded-engine
//! resource caps: an input size ceiling and a bounded compile cache.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use evalexpr::{ContextWithMutableVariables, HashMapContext, Node, Value as EvalValue};
use thiserror::Error;
use tracing::{debug, error};

use crate::config::defaults::{SCRIPT_CACHE_CAPACITY, SCRIPT_MAX_BYTES};
use crate::types::Value;

use super::library::ScriptLibrary;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script exceeds {limit} bytes ({actual})")]
    TooLarge { limit: usize, actual: usize },
    #[error("script compile error: {0}")]
    Compile(String),
    #[error("script execution error: {0}")]
    Execution(String),
    #[error("script returned unsupported type: {0}")]
    UnsupportedResult(String),
}

/// Named inputs for one evaluation.
///
/// Values bound to a data point are reachable both by their variable name
/// and by the `p<id>` form, so formulas may address points either way.
#[derive(Debug, Clone, Default)]
pub struct ScriptInputs {
    values: HashMap<String, Value>,
}

impl ScriptInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a plain named variable.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Bind a data point: by variable name and by `p<point_id>`.
    pub fn set_point(
        &mut self,
        point_id: i64,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        let value = value.into();
        self.values.insert(format!("p{}", point_id), value.clone());
        self.values.insert(name.into(), value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Result wrapper for callers that must never unwind (alarm evaluation,
/// virtual point batches).
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    pub success: bool,
    pub value: Option<Value>,
    pub error_message: String,
    pub execution_time_us: u64,
}

/// Formula executor with a compiled-AST cache.
///
/// Stateless between calls apart from the cache; shareable across worker
/// tasks behind an `Arc`.
pub struct ScriptExecutor {
    library: Arc<ScriptLibrary>,
    cache: RwLock<HashMap<u64, Arc<Node>>>,
    max_script_bytes: usize,
}

impl ScriptExecutor {
    pub fn new(library: Arc<ScriptLibrary>) -> Self {
        Self {
            library,
            cache: RwLock::new(HashMap::new()),
            max_script_bytes: SCRIPT_MAX_BYTES,
        }
    }

    /// Evaluate a formula against the given inputs and return the scalar.
    ///
    /// Coercion: bool → bool, any number → float, string → string;
    /// anything else is an error.
    pub fn evaluate(
        &self,
        script: &str,
        tenant_id: i32,
        inputs: &ScriptInputs,
    ) -> Result<Value, ScriptError> {
        if script.len() > self.max_script_bytes {
            return Err(ScriptError::TooLarge {
                limit: self.max_script_bytes,
                actual: script.len(),
            });
        }

        let processed = self.library.preprocess(script, tenant_id);
        let node = self.compile_cached(&processed)?;

        // Fresh context per call — no state survives an evaluation.
        let mut context = HashMapContext::new();
        for (name, value) in inputs.iter() {
            // Numbers always enter as floats, matching the result-side
            // number → double contract.
            let eval_value = match value {
                Value::Bool(b) => EvalValue::Boolean(*b),
                Value::Int(i) => EvalValue::Float(*i as f64),
                Value::Float(f) => EvalValue::Float(*f),
                Value::Text(s) => EvalValue::String(s.clone()),
            };
            context
                .set_value(name.clone(), eval_value)
                .map_err(|e| ScriptError::Execution(e.to_string()))?;
        }

        let result = node
            .eval_with_context_mut(&mut context)
            .map_err(|e| ScriptError::Execution(e.to_string()))?;

        match result {
            EvalValue::Boolean(b) => Ok(Value::Bool(b)),
            EvalValue::Int(i) => Ok(Value::Float(i as f64)),
            EvalValue::Float(f) => Ok(Value::Float(f)),
            EvalValue::String(s) => Ok(Value::Text(s)),
            other => Err(ScriptError::UnsupportedResult(format!("{:?}", other))),
        }
    }

    /// Never-unwinding wrapper around [`evaluate`](Self::evaluate):
    /// failures come back as a flagged outcome with the error text.
    pub fn execute_safe(&self, script: &str, tenant_id: i32, inputs: &ScriptInputs) -> ScriptOutcome {
        let start = Instant::now();
        match self.evaluate(script, tenant_id, inputs) {
            Ok(value) => ScriptOutcome {
                success: true,
                value: Some(value),
                error_message: String::new(),
                execution_time_us: start.elapsed().as_micros() as u64,
            },
            Err(e) => {
                error!(error = %e, script_len = script.len(), "Script execution failed");
                ScriptOutcome {
                    success: false,
                    value: None,
                    error_message: e.to_string(),
                    execution_time_us: start.elapsed().as_micros() as u64,
                }
            }
        }
    }

    /// Compiled-formula cache entries currently held.
    pub fn cache_len(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn compile_cached(&self, processed: &str) -> Result<Arc<Node>, ScriptError> {
        let mut hasher = DefaultHasher::new();
        processed.hash(&mut hasher);
        let key = hasher.finish();

        if let Some(node) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(Arc::clone(node));
        }

        let node = Arc::new(
            evalexpr::build_operator_tree(processed)
                .map_err(|e| ScriptError::Compile(e.to_string()))?,
        );

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        if cache.len() >= SCRIPT_CACHE_CAPACITY {
            debug!(capacity = SCRIPT_CACHE_CAPACITY, "Script cache full — clearing");
            cache.clear();
        }
        cache.insert(key, Arc::clone(&node));
        Ok(node)
    }
}
