//! Core value and identity types shared by every module.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value read from or written to a channel.
///
/// Most sweeps deal in `Float`, but configuration `value` entries may also
/// hold booleans (`output_enabled`), integers (`count`) or strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Boolean value (true/false)
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point number
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Array of 64-bit floats
    FloatArray(Vec<f64>),
    /// Nested array of parameter values
    Array(Vec<ParameterValue>),
    /// Absence of a value
    Null,
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(b) => write!(f, "{}", b),
            ParameterValue::Int(i) => write!(f, "{}", i),
            ParameterValue::Float(fl) => write!(f, "{}", fl),
            ParameterValue::String(s) => write!(f, "{}", s),
            ParameterValue::FloatArray(arr) => write!(f, "{:?}", arr),
            ParameterValue::Array(arr) => write!(f, "{:?}", arr),
            ParameterValue::Null => write!(f, "null"),
        }
    }
}

impl ParameterValue {
    /// Extract value as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(f) => Some(*f),
            ParameterValue::Int(i) => Some(*i as f64),
            ParameterValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Extract value as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(b) => Some(*b),
            ParameterValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// True for values a ramp can interpolate towards.
    pub fn is_float(&self) -> bool {
        matches!(self, ParameterValue::Float(_))
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}

impl From<Vec<f64>> for ParameterValue {
    fn from(value: Vec<f64>) -> Self {
        ParameterValue::FloatArray(value)
    }
}

/// Identifies one parameter of one gate.
///
/// Displays as `"{gate} {parameter}"`, which is also the label channels carry
/// after initialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterId {
    /// Gate name
    pub gate: String,
    /// Parameter name within the gate
    pub parameter: String,
}

impl ParameterId {
    /// Id of `parameter` on `gate`.
    pub fn new(gate: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            gate: gate.into(),
            parameter: parameter.into(),
        }
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.gate, self.parameter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_id_label() {
        let id = ParameterId::new("G1", "voltage");
        assert_eq!(id.to_string(), "G1 voltage");
    }

    #[test]
    fn deserializes_untagged_values() {
        let v: ParameterValue = serde_json::from_str("0.5").unwrap();
        assert_eq!(v, ParameterValue::Float(0.5));
        let v: ParameterValue = serde_json::from_str("3").unwrap();
        assert_eq!(v, ParameterValue::Int(3));
        let v: ParameterValue = serde_json::from_str("true").unwrap();
        assert_eq!(v.as_bool(), Some(true));
        let v: ParameterValue = serde_json::from_str("[1.0, 2.0]").unwrap();
        assert_eq!(v, ParameterValue::FloatArray(vec![1.0, 2.0]));
    }

    #[test]
    fn numeric_conversion() {
        assert_eq!(ParameterValue::Int(2).as_f64(), Some(2.0));
        assert_eq!(ParameterValue::from("1.5").as_f64(), Some(1.5));
        assert_eq!(ParameterValue::Bool(true).as_f64(), None);
        assert!(ParameterValue::Float(1.0).is_float());
        assert!(!ParameterValue::Int(1).is_float());
    }
}
