use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared type of a flag's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagType {
    Boolean,
    String,
    Number,
    Json,
}

impl std::fmt::Display for FlagType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlagType::Boolean => write!(f, "boolean"),
            FlagType::String => write!(f, "string"),
            FlagType::Number => write!(f, "number"),
            FlagType::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for FlagType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boolean" => Ok(FlagType::Boolean),
            "string" => Ok(FlagType::String),
            "number" => Ok(FlagType::Number),
            "json" => Ok(FlagType::Json),
            other => Err(format!("unknown flag type: {other}")),
        }
    }
}

/// A flag or variant value.
///
/// The `json` variant carries an opaque structured payload; comparisons
/// against it at rule-evaluation time tolerate type mismatches by
/// returning false rather than erroring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Number(f64),
    String(String),
    Json(Value),
}

impl FlagValue {
    /// Whether this value is usable as a flag of the given declared type.
    /// `json` flags accept any payload.
    pub fn is_compatible(&self, flag_type: FlagType) -> bool {
        match flag_type {
            FlagType::Boolean => matches!(self, FlagValue::Bool(_)),
            FlagType::String => matches!(self, FlagValue::String(_)),
            FlagType::Number => matches!(self, FlagValue::Number(_)),
            FlagType::Json => true,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FlagValue::Bool(b) => Value::Bool(*b),
            FlagValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FlagValue::String(s) => Value::String(s.clone()),
            FlagValue::Json(v) => v.clone(),
        }
    }

    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Bool(b) => FlagValue::Bool(b),
            Value::Number(n) => n
                .as_f64()
                .map(FlagValue::Number)
                .unwrap_or(FlagValue::Json(Value::Number(n))),
            Value::String(s) => FlagValue::String(s),
            other => FlagValue::Json(other),
        }
    }
}

impl From<bool> for FlagValue {
    fn from(b: bool) -> Self {
        FlagValue::Bool(b)
    }
}

impl From<f64> for FlagValue {
    fn from(n: f64) -> Self {
        FlagValue::Number(n)
    }
}

impl From<&str> for FlagValue {
    fn from(s: &str) -> Self {
        FlagValue::String(s.to_string())
    }
}
