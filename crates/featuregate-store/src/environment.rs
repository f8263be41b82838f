use chrono::{DateTime, Utc};
use featuregate_engine::EnvironmentId;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static ENVIRONMENT_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").expect("static pattern"));

/// A named deployment ring (`production`, `canary`, …). Evaluation
/// requests carry an environment string freely; stored environments
/// exist for admin bookkeeping and key uniqueness per organization
/// scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: EnvironmentId,
    pub key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Environment {
    pub fn validate_key(key: &str) -> bool {
        ENVIRONMENT_KEY_PATTERN.is_match(key)
    }
}

#[derive(Debug, Clone)]
pub struct NewEnvironment {
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}
