//! Admin rule CRUD and reordering, nested under a flag.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use featuregate_engine::{Condition, Flag, FlagId, FlagValue, Rule, RuleId};
use featuregate_store::{AuditAction, NewRule, RuleUpdate};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{authorize, owned_flag, record_audit};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleBody {
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default = "Condition::always")]
    pub conditions: Condition,
    pub value: FlagValue,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ReorderBody {
    pub ids: Vec<String>,
}

fn rule_not_found() -> ApiError {
    ApiError::new(crate::error::ErrorCode::FlagNotFound, "rule not found")
}

/// Resolves a rule under an owned flag; both must line up or the caller
/// learns nothing.
async fn owned_rule(
    state: &AppState,
    admin: &super::AdminContext,
    raw_flag_id: &str,
    raw_rule_id: &str,
) -> Result<(Flag, Rule), ApiError> {
    let flag_id: FlagId = super::parse_id(raw_flag_id, ApiError::flag_not_found())?;
    let flag = owned_flag(state, admin, flag_id).await?;
    let rule_id: RuleId = super::parse_id(raw_rule_id, rule_not_found())?;
    let rule = state
        .store
        .rule_by_id(rule_id)
        .await?
        .filter(|rule| rule.flag_id == flag.id)
        .ok_or_else(rule_not_found)?;
    Ok((flag, rule))
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(flag_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let flag_id: FlagId = super::parse_id(&flag_id, ApiError::flag_not_found())?;
    let flag = owned_flag(&state, &admin, flag_id).await?;
    let rules = state.store.rules_for_flag(flag.id).await?;
    Ok(Json(json!({ "rules": rules })))
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(flag_id): Path<String>,
    Json(body): Json<RuleBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let flag_id: FlagId = super::parse_id(&flag_id, ApiError::flag_not_found())?;
    let flag = owned_flag(&state, &admin, flag_id).await?;
    let rule = state
        .store
        .create_rule(NewRule {
            flag_id: flag.id,
            priority: body.priority,
            conditions: body.conditions,
            value: body.value,
            variant: body.variant,
            percentage: body.percentage,
            enabled: body.enabled.unwrap_or(true),
        })
        .await?;
    state.cache.invalidate_flag(&flag.key);

    let mut detail = Map::new();
    detail.insert(
        "newValue".to_string(),
        serde_json::to_value(&rule).unwrap_or(Value::Null),
    );
    record_audit(
        &state,
        &admin,
        &headers,
        "POST",
        format!("/admin/flags/{flag_id}/rules"),
        AuditAction::RuleAdded,
        Some(flag.id),
        detail,
    );
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(&rule).unwrap_or(Value::Null)),
    ))
}

pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((flag_id, rule_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let (_, rule) = owned_rule(&state, &admin, &flag_id, &rule_id).await?;
    Ok(Json(serde_json::to_value(&rule).unwrap_or(Value::Null)))
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((flag_id, rule_id)): Path<(String, String)>,
    Json(body): Json<RuleUpdate>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let (flag, previous) = owned_rule(&state, &admin, &flag_id, &rule_id).await?;
    let updated = state.store.update_rule(previous.id, body).await?;
    state.cache.invalidate_flag(&flag.key);

    let mut detail = Map::new();
    detail.insert(
        "previousValue".to_string(),
        serde_json::to_value(&previous).unwrap_or(Value::Null),
    );
    detail.insert(
        "newValue".to_string(),
        serde_json::to_value(&updated).unwrap_or(Value::Null),
    );
    record_audit(
        &state,
        &admin,
        &headers,
        "PATCH",
        format!("/admin/flags/{flag_id}/rules/{rule_id}"),
        AuditAction::RuleUpdated,
        Some(flag.id),
        detail,
    );
    Ok(Json(serde_json::to_value(&updated).unwrap_or(Value::Null)))
}

pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((flag_id, rule_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let (flag, previous) = owned_rule(&state, &admin, &flag_id, &rule_id).await?;
    state.store.delete_rule(previous.id).await?;
    state.cache.invalidate_flag(&flag.key);

    let mut detail = Map::new();
    detail.insert(
        "previousValue".to_string(),
        serde_json::to_value(&previous).unwrap_or(Value::Null),
    );
    record_audit(
        &state,
        &admin,
        &headers,
        "DELETE",
        format!("/admin/flags/{flag_id}/rules/{rule_id}"),
        AuditAction::RuleDeleted,
        Some(flag.id),
        detail,
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reorder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(flag_id): Path<String>,
    Json(body): Json<ReorderBody>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let flag_id: FlagId = super::parse_id(&flag_id, ApiError::flag_not_found())?;
    let flag = owned_flag(&state, &admin, flag_id).await?;
    let mut order = Vec::with_capacity(body.ids.len());
    for raw in &body.ids {
        order.push(super::parse_id::<RuleId>(raw, rule_not_found())?);
    }
    state.store.reorder_rules(flag.id, &order).await?;
    state.cache.invalidate_flag(&flag.key);

    let mut detail = Map::new();
    detail.insert("newValue".to_string(), json!(body.ids));
    record_audit(
        &state,
        &admin,
        &headers,
        "POST",
        format!("/admin/flags/{flag_id}/rules/reorder"),
        AuditAction::RuleUpdated,
        Some(flag.id),
        detail,
    );
    let rules = state.store.rules_for_flag(flag.id).await?;
    Ok(Json(json!({ "rules": rules })))
}
