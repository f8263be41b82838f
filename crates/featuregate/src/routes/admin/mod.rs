//! Admin surface: enforcement gates and shared helpers.
//!
//! Three gates run in order for every admin request: the role gate
//! (session present, role intersection non-empty), the organization
//! gate (multi-tenant sessions must carry an organization, explicit
//! mismatches are rejected), and the ownership gate (a flag outside the
//! caller's organization answers `404 FLAG_NOT_FOUND`, never revealing
//! that it exists).

pub mod audit;
pub mod environments;
pub mod flags;
pub mod overrides;
pub mod rules;

use axum::http::HeaderMap;
use featuregate_engine::{Flag, FlagId};
use featuregate_store::{AuditAction, NewAuditEntry};
use serde_json::{Map, Value};

use crate::error::{ApiError, ErrorCode};
use crate::http::{client_ip, user_agent};
use crate::rate_limit::RateClass;
use crate::session::Session;
use crate::state::AppState;

pub struct AdminContext {
    pub session: Session,
    /// Organization scope all storage calls are made under. In
    /// multi-tenant mode this is always the session's organization.
    pub scope: Option<String>,
}

/// Runs the role and organization gates.
pub fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    explicit_org: Option<&str>,
) -> Result<AdminContext, ApiError> {
    if !state.options.admin_enabled {
        return Err(ApiError::new(
            ErrorCode::AdminAccessDisabled,
            "admin access is disabled",
        ));
    }
    let session = state
        .sessions
        .resolve(headers)
        .ok_or_else(ApiError::unauthenticated)?;
    state.limiter.check(RateClass::Admin, &session.user_id)?;
    if !session.has_any_role(&state.options.admin_roles) {
        return Err(ApiError::new(
            ErrorCode::UnauthorizedAccess,
            "admin role required",
        ));
    }
    if state.options.multi_tenant {
        let organization = session.organization_id.clone().ok_or_else(|| {
            ApiError::new(
                ErrorCode::OrganizationRequired,
                "session has no organization",
            )
        })?;
        if explicit_org.is_some_and(|requested| requested != organization) {
            return Err(ApiError::new(
                ErrorCode::UnauthorizedAccess,
                "organization mismatch",
            ));
        }
        Ok(AdminContext {
            session,
            scope: Some(organization),
        })
    } else {
        Ok(AdminContext {
            session,
            scope: explicit_org.map(str::to_string),
        })
    }
}

/// Ownership gate: resolves a flag the caller is allowed to address.
pub async fn owned_flag(
    state: &AppState,
    admin: &AdminContext,
    id: FlagId,
) -> Result<Flag, ApiError> {
    let flag = state
        .store
        .flag_by_id(id)
        .await?
        .ok_or_else(ApiError::flag_not_found)?;
    if state.options.multi_tenant && flag.organization_id != admin.scope {
        // masking: do not disclose that the flag exists
        return Err(ApiError::flag_not_found());
    }
    Ok(flag)
}

/// Enqueues an audit entry for a successful admin action.
#[allow(clippy::too_many_arguments)]
pub fn record_audit(
    state: &AppState,
    admin: &AdminContext,
    headers: &HeaderMap,
    method: &str,
    path: String,
    action: AuditAction,
    flag_id: Option<FlagId>,
    detail: Map<String, Value>,
) {
    if !state.options.audit_enabled {
        return;
    }
    let mut metadata = Map::new();
    metadata.insert("method".to_string(), Value::String(method.to_string()));
    metadata.insert("path".to_string(), Value::String(path));
    if let Some(ip) = client_ip(headers) {
        metadata.insert("ip".to_string(), Value::String(ip));
    }
    if let Some(agent) = user_agent(headers) {
        metadata.insert("userAgent".to_string(), Value::String(agent));
    }
    metadata.extend(detail);
    state.recorder.record_audit(NewAuditEntry {
        flag_id,
        user_id: Some(admin.session.user_id.clone()),
        action,
        organization_id: admin.scope.clone(),
        metadata,
    });
}

/// Parses a path id, masking malformed ids as the entity's not-found.
pub fn parse_id<T: std::str::FromStr>(raw: &str, not_found: ApiError) -> Result<T, ApiError> {
    raw.parse().map_err(|_| not_found)
}
