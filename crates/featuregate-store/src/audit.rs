//! Append-only audit log entries for admin mutations and accesses.

use chrono::{DateTime, Utc};
use featuregate_engine::{AuditId, FlagId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::query::DateRange;

/// The auditable actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Updated,
    Deleted,
    Enabled,
    Disabled,
    RuleAdded,
    RuleUpdated,
    RuleDeleted,
    OverrideAdded,
    OverrideRemoved,
    Evaluate,
    AdminAccess,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditAction::Created => "created",
            AuditAction::Updated => "updated",
            AuditAction::Deleted => "deleted",
            AuditAction::Enabled => "enabled",
            AuditAction::Disabled => "disabled",
            AuditAction::RuleAdded => "rule_added",
            AuditAction::RuleUpdated => "rule_updated",
            AuditAction::RuleDeleted => "rule_deleted",
            AuditAction::OverrideAdded => "override_added",
            AuditAction::OverrideRemoved => "override_removed",
            AuditAction::Evaluate => "evaluate",
            AuditAction::AdminAccess => "admin_access",
        };
        write!(f, "{s}")
    }
}

/// An audit entry to append. `flag_id` stays populated even after the
/// flag itself is deleted - audit history outlives its subject.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub flag_id: Option<FlagId>,
    pub user_id: Option<String>,
    pub action: AuditAction,
    pub organization_id: Option<String>,
    /// Request detail: path, method, ip, user-agent, previous/new values.
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: AuditId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_id: Option<FlagId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Filter for audit listings. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub flag_id: Option<FlagId>,
    pub user_id: Option<String>,
    pub action: Option<AuditAction>,
    pub organization_id: Option<String>,
    pub range: Option<DateRange>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if self.flag_id.is_some() && entry.flag_id != self.flag_id {
            return false;
        }
        if let Some(user_id) = &self.user_id {
            if entry.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(action) = self.action {
            if entry.action != action {
                return false;
            }
        }
        if let Some(org) = &self.organization_id {
            if entry.organization_id.as_deref() != Some(org.as_str()) {
                return false;
            }
        }
        if let Some(range) = &self.range {
            if !range.contains(entry.created_at) {
                return false;
            }
        }
        true
    }
}
