//! Virtual point definitions

use serde::{Deserialize, Serialize};

/// Binding of an input data point to the variable name the formula uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualPointDependency {
    pub point_id: i64,
    pub variable_name: String,
}

/// Expected result type of a virtual point formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VirtualDataType {
    #[default]
    Float,
    Int,
    Bool,
    Text,
}

/// A computed point: a formula over a set of dependency points.
///
/// The dependency list defines the subset of incoming points that trigger
/// recomputation; a message containing none of them leaves the virtual
/// point untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualPoint {
    pub id: i64,
    pub tenant_id: i32,
    pub name: String,
    pub formula: String,
    #[serde(default)]
    pub dependencies: Vec<VirtualPointDependency>,
    #[serde(default)]
    pub data_type: VirtualDataType,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl VirtualPoint {
    pub fn depends_on(&self, point_id: i64) -> bool {
        self.dependencies.iter().any(|d| d.point_id == point_id)
    }
}
