//! The backend-agnostic storage contract.
//!
//! Every backend preserves the same invariants: `(organization, key)`
//! uniqueness for flags (a missing organization is its own scope),
//! cascade deletion of rules and overrides with the owning flag, rules
//! returned in `(priority, created_at, id)` order, and deterministic
//! listings under a stable ordering. Evaluation is backend-independent;
//! the engine only ever sees the types the contract returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use featuregate_engine::{
    AuditId, Condition, EnvironmentId, Flag, FlagId, FlagType, FlagValue, Override, OverrideId,
    Rule, RuleId, Variant,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::analytics::{EvaluationStats, NewEvaluationRecord, StatsQuery, UsageMetrics};
use crate::audit::{AuditEntry, AuditFilter, NewAuditEntry};
use crate::environment::{Environment, EnvironmentUpdate, NewEnvironment};
use crate::error::StoreError;
use crate::query::{DateRange, FlagQuery};

/// What a backend does with a tracked evaluation whose flag key does
/// not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownFlagPolicy {
    /// Warn and drop the record (default).
    #[default]
    Log,
    /// Surface [`StoreError::UnknownFlag`] to the caller.
    Throw,
    /// Store under a reserved system flag, preserving the original key
    /// in the record context.
    TrackUnknown,
}

/// Key of the reserved system flag unknown evaluations are filed under
/// when the policy is `track-unknown`.
pub const UNKNOWN_FLAG_KEY: &str = "__system_unknown__";

/// Fields for a new flag. Timestamps and the id are assigned by the
/// backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFlag {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub default_value: FlagValue,
    #[serde(default = "default_rollout")]
    pub rollout_percentage: f64,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

fn default_enabled() -> bool {
    true
}

fn default_rollout() -> f64 {
    100.0
}

impl NewFlag {
    /// Materializes the flag with fresh id and timestamps, checking the
    /// model invariants.
    pub fn into_flag(self, now: DateTime<Utc>) -> Result<Flag, StoreError> {
        let flag = Flag {
            id: FlagId::new(),
            key: self.key,
            name: self.name,
            description: self.description,
            flag_type: self.flag_type,
            enabled: self.enabled,
            default_value: self.default_value,
            rollout_percentage: self.rollout_percentage,
            organization_id: self.organization_id,
            variants: self.variants,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        };
        flag.validate()?;
        Ok(flag)
    }
}

/// Partial update of a flag. Absent fields are left unchanged; any
/// applied update bumps `updated_at`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub default_value: Option<FlagValue>,
    #[serde(default)]
    pub rollout_percentage: Option<f64>,
    #[serde(default)]
    pub variants: Option<Vec<Variant>>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl FlagUpdate {
    /// Applies the update in place and re-validates the result.
    pub fn apply(self, flag: &mut Flag, now: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(name) = self.name {
            flag.name = name;
        }
        if let Some(description) = self.description {
            flag.description = Some(description);
        }
        if let Some(enabled) = self.enabled {
            flag.enabled = enabled;
        }
        if let Some(default_value) = self.default_value {
            flag.default_value = default_value;
        }
        if let Some(rollout) = self.rollout_percentage {
            flag.rollout_percentage = rollout;
        }
        if let Some(variants) = self.variants {
            flag.variants = variants;
        }
        if let Some(metadata) = self.metadata {
            flag.metadata = Some(metadata);
        }
        flag.updated_at = now;
        flag.validate()?;
        Ok(())
    }
}

/// Fields for a new rule. Priority defaults to the end of the flag's
/// rule list when omitted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRule {
    pub flag_id: FlagId,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default = "Condition::always")]
    pub conditions: Condition,
    pub value: FlagValue,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleUpdate {
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub conditions: Option<Condition>,
    #[serde(default)]
    pub value: Option<FlagValue>,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl RuleUpdate {
    pub fn apply(self, rule: &mut Rule) -> Result<(), StoreError> {
        if let Some(priority) = self.priority {
            rule.priority = priority;
        }
        if let Some(conditions) = self.conditions {
            rule.conditions = conditions;
        }
        if let Some(value) = self.value {
            rule.value = value;
        }
        if let Some(variant) = self.variant {
            rule.variant = Some(variant);
        }
        if let Some(percentage) = self.percentage {
            rule.percentage = Some(percentage);
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
        rule.validate()?;
        Ok(())
    }
}

/// Fields for a new override. `(flag_id, user_id)` is unique; creating
/// a second override for the pair conflicts.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOverride {
    pub flag_id: FlagId,
    pub user_id: String,
    pub value: FlagValue,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideUpdate {
    #[serde(default)]
    pub value: Option<FlagValue>,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl OverrideUpdate {
    pub fn apply(self, existing: &mut Override) {
        if let Some(value) = self.value {
            existing.value = value;
        }
        if let Some(variant) = self.variant {
            existing.variant = Some(variant);
        }
        if let Some(expires_at) = self.expires_at {
            existing.expires_at = Some(expires_at);
        }
        if let Some(reason) = self.reason {
            existing.reason = Some(reason);
        }
    }
}

/// The storage contract. All methods take `&self`; backends manage
/// their own interior synchronization. Dropping a returned future
/// cancels the operation without partial effects becoming observable
/// where the backend supports it.
#[async_trait]
pub trait FlagStore: Send + Sync {
    // -- flags

    /// Looks up a flag by key within an organization scope. A missing
    /// organization id addresses the global scope only.
    async fn flag_by_key(
        &self,
        key: &str,
        organization_id: Option<&str>,
    ) -> Result<Option<Flag>, StoreError>;

    async fn flag_by_id(&self, id: FlagId) -> Result<Option<Flag>, StoreError>;

    /// Bulk key lookup for batch evaluation: one round trip per batch.
    async fn flags_by_keys(
        &self,
        keys: &[String],
        organization_id: Option<&str>,
    ) -> Result<Vec<Flag>, StoreError>;

    async fn list_flags(
        &self,
        organization_id: Option<&str>,
        query: &FlagQuery,
    ) -> Result<Vec<Flag>, StoreError>;

    async fn create_flag(&self, new_flag: NewFlag) -> Result<Flag, StoreError>;

    async fn update_flag(&self, id: FlagId, update: FlagUpdate) -> Result<Flag, StoreError>;

    /// Deletes a flag and cascades to its rules, overrides, and
    /// evaluation records. Audit entries are retained.
    async fn delete_flag(&self, id: FlagId) -> Result<(), StoreError>;

    // -- rules

    /// Rules in evaluation order: `(priority asc, created_at asc, id)`.
    async fn rules_for_flag(&self, flag_id: FlagId) -> Result<Vec<Rule>, StoreError>;

    async fn rule_by_id(&self, id: RuleId) -> Result<Option<Rule>, StoreError>;

    async fn create_rule(&self, new_rule: NewRule) -> Result<Rule, StoreError>;

    async fn update_rule(&self, id: RuleId, update: RuleUpdate) -> Result<Rule, StoreError>;

    async fn delete_rule(&self, id: RuleId) -> Result<(), StoreError>;

    /// Reassigns `priority = index + 1` for the submitted permutation
    /// of the flag's rules, atomically.
    async fn reorder_rules(&self, flag_id: FlagId, order: &[RuleId]) -> Result<(), StoreError>;

    // -- overrides

    async fn override_for(
        &self,
        flag_id: FlagId,
        user_id: &str,
    ) -> Result<Option<Override>, StoreError>;

    async fn override_by_id(&self, id: OverrideId) -> Result<Option<Override>, StoreError>;

    async fn create_override(&self, new_override: NewOverride) -> Result<Override, StoreError>;

    async fn update_override(
        &self,
        id: OverrideId,
        update: OverrideUpdate,
    ) -> Result<Override, StoreError>;

    async fn delete_override(&self, id: OverrideId) -> Result<(), StoreError>;

    async fn list_overrides(
        &self,
        flag_id: Option<FlagId>,
        user_id: Option<&str>,
    ) -> Result<Vec<Override>, StoreError>;

    // -- analytics

    /// Appends an evaluation record. Unknown flag keys follow the
    /// backend's [`UnknownFlagPolicy`]; under the default policy this
    /// method never fails the caller for an unknown key.
    async fn track_evaluation(&self, record: NewEvaluationRecord) -> Result<(), StoreError>;

    async fn evaluation_stats(
        &self,
        flag_id: FlagId,
        query: &StatsQuery,
    ) -> Result<EvaluationStats, StoreError>;

    async fn usage_metrics(
        &self,
        organization_id: Option<&str>,
        range: Option<DateRange>,
    ) -> Result<UsageMetrics, StoreError>;

    // -- audit

    async fn log_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry, StoreError>;

    async fn audit_logs(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, StoreError>;

    async fn audit_by_id(&self, id: AuditId) -> Result<Option<AuditEntry>, StoreError>;

    /// Removes audit entries older than the cutoff; returns how many
    /// were deleted.
    async fn cleanup_audit_logs(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    // -- environments

    async fn list_environments(
        &self,
        organization_id: Option<&str>,
    ) -> Result<Vec<Environment>, StoreError>;

    async fn environment_by_id(
        &self,
        id: EnvironmentId,
    ) -> Result<Option<Environment>, StoreError>;

    async fn create_environment(
        &self,
        new_environment: NewEnvironment,
    ) -> Result<Environment, StoreError>;

    async fn update_environment(
        &self,
        id: EnvironmentId,
        update: EnvironmentUpdate,
    ) -> Result<Environment, StoreError>;

    async fn delete_environment(&self, id: EnvironmentId) -> Result<(), StoreError>;

    // -- health

    /// Cheap liveness probe for `/health`.
    async fn healthy(&self) -> bool;
}
