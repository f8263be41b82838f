use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ModelError;
use crate::ident::FlagId;
use crate::value::{FlagType, FlagValue};

/// URL-safe flag key pattern.
static FLAG_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static pattern"));

/// Tolerance when checking that variant weights sum to 100.
const WEIGHT_SUM_EPSILON: f64 = 0.01;

/// A named alternative value of a flag with a selection weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub key: String,
    pub value: FlagValue,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// A named, typed decision point.
///
/// Flags are owned by their organization; a missing `organization_id`
/// places the flag in the global scope, which is a scope of its own for
/// key uniqueness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub id: FlagId,
    pub key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub enabled: bool,
    pub default_value: FlagValue,
    pub rollout_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flag {
    /// Whether `key` is a valid flag key.
    pub fn validate_key(key: &str) -> bool {
        FLAG_KEY_PATTERN.is_match(key)
    }

    /// Checks the structural invariants of the flag: key shape, rollout
    /// range, default/variant type compatibility, and variant weights
    /// summing to 100 within tolerance.
    pub fn validate(&self) -> Result<(), ModelError> {
        if !Self::validate_key(&self.key) {
            return Err(ModelError::InvalidFlagKey(self.key.clone()));
        }
        if !(0.0..=100.0).contains(&self.rollout_percentage) {
            return Err(ModelError::InvalidRollout(self.rollout_percentage));
        }
        if !self.default_value.is_compatible(self.flag_type) {
            return Err(ModelError::IncompatibleDefault(self.flag_type.to_string()));
        }
        validate_variants(&self.variants, self.flag_type)?;
        Ok(())
    }

    /// Looks up a variant by key.
    pub fn variant(&self, key: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.key == key)
    }
}

/// Validates a variant list: non-negative weights summing to 100 ± 0.01,
/// unique keys, and values compatible with the flag type. An empty list
/// is valid (the flag has no variants).
pub fn validate_variants(variants: &[Variant], flag_type: FlagType) -> Result<(), ModelError> {
    if variants.is_empty() {
        return Ok(());
    }
    let mut seen = std::collections::HashSet::new();
    let mut sum = 0.0;
    for variant in variants {
        if variant.weight < 0.0 {
            return Err(ModelError::NegativeVariantWeight(variant.weight));
        }
        if !seen.insert(variant.key.as_str()) {
            return Err(ModelError::DuplicateVariant(variant.key.clone()));
        }
        if !variant.value.is_compatible(flag_type) {
            return Err(ModelError::IncompatibleVariant(variant.key.clone()));
        }
        sum += variant.weight;
    }
    if (sum - 100.0).abs() > WEIGHT_SUM_EPSILON {
        return Err(ModelError::VariantWeightSum(sum));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag(variants: Vec<Variant>) -> Flag {
        let now = Utc::now();
        Flag {
            id: FlagId::new(),
            key: "checkout-redesign".to_string(),
            name: "Checkout redesign".to_string(),
            description: None,
            flag_type: FlagType::Boolean,
            enabled: true,
            default_value: FlagValue::Bool(false),
            rollout_percentage: 100.0,
            organization_id: None,
            variants,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_validate_key() {
        assert!(Flag::validate_key("dark-mode"));
        assert!(Flag::validate_key("dark_mode_2"));
        assert!(!Flag::validate_key("dark mode"));
        assert!(!Flag::validate_key("dark.mode"));
        assert!(!Flag::validate_key(""));
    }

    #[test]
    fn test_weights_must_sum_to_100() {
        let f = flag(vec![
            Variant {
                key: "a".to_string(),
                value: FlagValue::Bool(true),
                weight: 50.0,
                metadata: None,
            },
            Variant {
                key: "b".to_string(),
                value: FlagValue::Bool(false),
                weight: 49.0,
                metadata: None,
            },
        ]);
        assert!(matches!(
            f.validate(),
            Err(ModelError::VariantWeightSum(_))
        ));
    }

    #[test]
    fn test_weight_sum_tolerance() {
        let f = flag(vec![
            Variant {
                key: "a".to_string(),
                value: FlagValue::Bool(true),
                weight: 33.33,
                metadata: None,
            },
            Variant {
                key: "b".to_string(),
                value: FlagValue::Bool(false),
                weight: 33.33,
                metadata: None,
            },
            Variant {
                key: "c".to_string(),
                value: FlagValue::Bool(false),
                weight: 33.34,
                metadata: None,
            },
        ]);
        assert!(f.validate().is_ok());
    }

    #[test]
    fn test_duplicate_variant_rejected() {
        let f = flag(vec![
            Variant {
                key: "a".to_string(),
                value: FlagValue::Bool(true),
                weight: 50.0,
                metadata: None,
            },
            Variant {
                key: "a".to_string(),
                value: FlagValue::Bool(false),
                weight: 50.0,
                metadata: None,
            },
        ]);
        assert!(matches!(f.validate(), Err(ModelError::DuplicateVariant(_))));
    }

    #[test]
    fn test_incompatible_default_rejected() {
        let mut f = flag(vec![]);
        f.default_value = FlagValue::String("nope".to_string());
        assert!(matches!(
            f.validate(),
            Err(ModelError::IncompatibleDefault(_))
        ));
    }
}
