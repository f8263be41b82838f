//! Context attribute validation and header whitelisting.
//!
//! Attribute validation is strict and rejects the request; header
//! extraction is lenient and silently drops any header that fails its
//! declared validation.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ValidationError;

static ATTRIBUTE_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("static pattern"));

/// Keys that would collide with object-model internals in downstream
/// consumers. Rejected at every nesting level.
const FORBIDDEN_KEYS: [&str; 6] = [
    "__proto__",
    "constructor",
    "prototype",
    "hasOwnProperty",
    "toString",
    "valueOf",
];

/// Shape and size limits applied to incoming attributes.
#[derive(Debug, Clone)]
pub struct AttributeLimits {
    pub max_depth: usize,
    pub max_array_elements: usize,
    pub max_object_properties: usize,
    pub max_string_bytes: usize,
    pub max_total_bytes: usize,
}

impl Default for AttributeLimits {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_array_elements: 100,
            max_object_properties: 100,
            max_string_bytes: 10 * 1024,
            max_total_bytes: 50 * 1024,
        }
    }
}

/// Validates an attribute map against the limits. Any violation maps to
/// the `VALIDATION_ERROR` wire code and rejects the whole request.
pub fn validate_attributes(
    attributes: &Map<String, Value>,
    limits: &AttributeLimits,
) -> Result<(), ValidationError> {
    let serialized = serde_json::to_string(attributes).unwrap_or_default();
    if serialized.len() > limits.max_total_bytes {
        return Err(ValidationError::AttributesTooLarge {
            max: limits.max_total_bytes,
        });
    }
    check_object(attributes, "", 1, limits)
}

fn check_key(key: &str) -> Result<(), ValidationError> {
    if FORBIDDEN_KEYS.contains(&key) {
        return Err(ValidationError::ForbiddenKey(key.to_string()));
    }
    if !ATTRIBUTE_KEY_PATTERN.is_match(key) {
        return Err(ValidationError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn check_object(
    object: &Map<String, Value>,
    path: &str,
    depth: usize,
    limits: &AttributeLimits,
) -> Result<(), ValidationError> {
    if object.len() > limits.max_object_properties {
        return Err(ValidationError::ObjectTooLarge {
            key: path.to_string(),
            max: limits.max_object_properties,
        });
    }
    for (key, value) in object {
        check_key(key)?;
        let child_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}.{key}")
        };
        check_value(value, &child_path, depth, limits)?;
    }
    Ok(())
}

fn check_value(
    value: &Value,
    path: &str,
    depth: usize,
    limits: &AttributeLimits,
) -> Result<(), ValidationError> {
    match value {
        Value::Null | Value::Bool(_) => Ok(()),
        Value::Number(n) => {
            if n.as_f64().is_none_or(|f| !f.is_finite()) {
                return Err(ValidationError::NonFiniteNumber {
                    key: path.to_string(),
                });
            }
            Ok(())
        }
        Value::String(s) => {
            if s.len() > limits.max_string_bytes {
                return Err(ValidationError::StringTooLong {
                    key: path.to_string(),
                    max: limits.max_string_bytes,
                });
            }
            Ok(())
        }
        Value::Array(items) => {
            if depth >= limits.max_depth {
                return Err(ValidationError::TooDeep {
                    max: limits.max_depth,
                });
            }
            if items.len() > limits.max_array_elements {
                return Err(ValidationError::ArrayTooLong {
                    key: path.to_string(),
                    max: limits.max_array_elements,
                });
            }
            for item in items {
                check_value(item, path, depth + 1, limits)?;
            }
            Ok(())
        }
        Value::Object(object) => {
            if depth >= limits.max_depth {
                return Err(ValidationError::TooDeep {
                    max: limits.max_depth,
                });
            }
            check_object(object, path, depth + 1, limits)
        }
    }
}

/// Declared value type of a whitelisted header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderValueType {
    String,
    Number,
    Boolean,
    Json,
    Enum,
}

/// One entry of the header whitelist: only headers with a rule
/// contribute to the evaluation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRule {
    /// Header name, lower-case (`x-deployment-ring`).
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: HeaderValueType,
    /// Optional pattern the raw header value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Allowed values when `type` is `enum`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
}

impl HeaderRule {
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: HeaderValueType::String,
            pattern: None,
            max_length: Some(256),
            allowed: Vec::new(),
        }
    }

    pub fn enumerated(name: impl Into<String>, allowed: &[&str]) -> Self {
        Self {
            name: name.into(),
            value_type: HeaderValueType::Enum,
            pattern: None,
            max_length: Some(256),
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn parse(&self, raw: &str) -> Option<Value> {
        if self.max_length.is_some_and(|max| raw.len() > max) {
            return None;
        }
        if let Some(pattern) = &self.pattern {
            let re = Regex::new(pattern).ok()?;
            if !re.is_match(raw) {
                return None;
            }
        }
        match self.value_type {
            HeaderValueType::String => Some(Value::String(raw.to_string())),
            HeaderValueType::Number => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            HeaderValueType::Boolean => match raw {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            HeaderValueType::Json => serde_json::from_str(raw).ok(),
            HeaderValueType::Enum => self
                .allowed
                .iter()
                .any(|v| v == raw)
                .then(|| Value::String(raw.to_string())),
        }
    }
}

/// Converts an `x-kebab-case` header name into a camelCase attribute
/// key: `x-device-type` → `deviceType`.
pub fn header_attribute_key(name: &str) -> String {
    let trimmed = name.strip_prefix("x-").unwrap_or(name);
    let mut out = String::with_capacity(trimmed.len());
    let mut upper_next = false;
    for ch in trimmed.chars() {
        if ch == '-' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Extracts whitelisted headers into attribute key/value pairs. Headers
/// that fail their rule are dropped, not errors; the request proceeds
/// without them.
pub fn extract_header_attributes(
    rules: &[HeaderRule],
    headers: &[(String, String)],
) -> Map<String, Value> {
    let mut out = Map::new();
    for rule in rules {
        let Some((_, raw)) = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&rule.name))
        else {
            continue;
        };
        match rule.parse(raw) {
            Some(value) => {
                out.insert(header_attribute_key(&rule.name), value);
            }
            None => {
                debug!(header = %rule.name, "dropping header failing whitelist validation");
            }
        }
    }
    out
}
