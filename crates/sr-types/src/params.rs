//! Concrete hyperparameter values handed to objective functions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A concrete parameter value proposed by an optimizer.
///
/// Untagged so checkpoints and tracking events read naturally as JSON. `Int`
/// is listed before `Float` so whole numbers deserialize back as integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Json(v) => v.as_f64(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(_) => None,
            Self::Json(v) => v.as_i64(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(v) => v.as_str(),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            // Bare strings read better in CSV cells than quoted JSON.
            Self::Json(serde_json::Value::String(s)) => write!(f, "{s}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// One trial configuration: hyperparameter name to proposed value.
pub type ParameterSet = BTreeMap<String, ParameterValue>;

/// Named metric values reported by one objective evaluation.
pub type Metrics = BTreeMap<String, f64>;
