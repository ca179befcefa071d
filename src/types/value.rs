//! Point value variant and quality codes

use serde::{Deserialize, Serialize};

/// Dynamic value carried by a data point.
///
/// Protocol drivers produce whichever variant the field device speaks;
/// downstream consumers coerce with the `as_*` accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Coerce to a double the way the alarm evaluator expects:
    /// bool → 0/1, text → parsed or 0.0.
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Int(i) => *i as f64,
            Value::Float(f) => *f,
            Value::Text(s) => s.trim().parse().unwrap_or(0.0),
        }
    }

    /// Digital interpretation: any non-zero numeric is true.
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Float(0.0)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// Data quality as reported by the protocol driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Quality {
    #[default]
    Good,
    Bad,
    Uncertain,
    NotConnected,
}

impl Quality {
    pub fn is_usable(self) -> bool {
        matches!(self, Quality::Good | Quality::Uncertain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_text_to_double() {
        assert_eq!(Value::Text("42.5".into()).as_f64(), 42.5);
        assert_eq!(Value::Text("garbage".into()).as_f64(), 0.0);
    }

    #[test]
    fn digital_interpretation() {
        assert!(Value::Float(0.1).as_bool());
        assert!(!Value::Int(0).as_bool());
        assert!(!Value::Text("false".into()).as_bool());
    }

    #[test]
    fn untagged_json_round_trip() {
        let v: Value = serde_json::from_str("150.5").unwrap();
        assert_eq!(v, Value::Float(150.5));
        let v: Value = serde_json::from_str("true").unwrap();
        assert_eq!(v, Value::Bool(true));
    }
}
