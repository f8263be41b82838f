//! Admin override CRUD. Overrides are addressed either directly by id
//! or filtered by flag/user; every path resolves the owning flag and
//! runs it through the ownership gate.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use featuregate_engine::{FlagId, FlagValue, Override, OverrideId};
use featuregate_store::{AuditAction, NewOverride, OverrideUpdate};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{authorize, owned_flag, record_audit};
use crate::error::{ApiError, ErrorCode};
use crate::state::AppState;

fn override_not_found() -> ApiError {
    ApiError::new(ErrorCode::OverrideNotFound, "override not found")
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    #[serde(default)]
    pub flag_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideBody {
    pub flag_id: String,
    pub user_id: String,
    pub value: FlagValue,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Resolves an override by id and gates on its owning flag.
async fn owned_override(
    state: &AppState,
    admin: &super::AdminContext,
    raw_id: &str,
) -> Result<Override, ApiError> {
    let id: OverrideId = super::parse_id(raw_id, override_not_found())?;
    let record = state
        .store
        .override_by_id(id)
        .await?
        .ok_or_else(override_not_found)?;
    // flag lookup enforces the masking 404 for foreign flags
    owned_flag(state, admin, record.flag_id).await?;
    Ok(record)
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let flag_id = match &params.flag_id {
        Some(raw) => {
            let id: FlagId = super::parse_id(raw, ApiError::flag_not_found())?;
            // gate before filtering so foreign flags 404
            owned_flag(&state, &admin, id).await?;
            Some(id)
        }
        None => None,
    };
    let mut overrides = state
        .store
        .list_overrides(flag_id, params.user_id.as_deref())
        .await?;
    if state.options.multi_tenant && flag_id.is_none() {
        // unfiltered listing: keep only overrides whose flag the caller
        // owns
        let mut visible = Vec::with_capacity(overrides.len());
        for record in overrides {
            if owned_flag(&state, &admin, record.flag_id).await.is_ok() {
                visible.push(record);
            }
        }
        overrides = visible;
    }
    Ok(Json(json!({ "overrides": overrides })))
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<OverrideBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let flag_id: FlagId = super::parse_id(&body.flag_id, ApiError::flag_not_found())?;
    let flag = owned_flag(&state, &admin, flag_id).await?;
    let record = state
        .store
        .create_override(NewOverride {
            flag_id: flag.id,
            user_id: body.user_id,
            value: body.value,
            variant: body.variant,
            expires_at: body.expires_at,
            reason: body.reason,
        })
        .await?;
    state.cache.invalidate_flag(&flag.key);

    let mut detail = Map::new();
    detail.insert(
        "newValue".to_string(),
        serde_json::to_value(&record).unwrap_or(Value::Null),
    );
    record_audit(
        &state,
        &admin,
        &headers,
        "POST",
        "/admin/overrides".to_string(),
        AuditAction::OverrideAdded,
        Some(flag.id),
        detail,
    );
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(&record).unwrap_or(Value::Null)),
    ))
}

pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let record = owned_override(&state, &admin, &id).await?;
    Ok(Json(serde_json::to_value(&record).unwrap_or(Value::Null)))
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<OverrideUpdate>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let previous = owned_override(&state, &admin, &id).await?;
    let updated = state.store.update_override(previous.id, body).await?;
    let flag = owned_flag(&state, &admin, updated.flag_id).await?;
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
        format!("/admin/overrides/{id}"),
        AuditAction::OverrideAdded,
        Some(updated.flag_id),
        detail,
    );
    Ok(Json(serde_json::to_value(&updated).unwrap_or(Value::Null)))
}

pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let previous = owned_override(&state, &admin, &id).await?;
    state.store.delete_override(previous.id).await?;
    let flag = owned_flag(&state, &admin, previous.flag_id).await?;
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
        format!("/admin/overrides/{id}"),
        AuditAction::OverrideRemoved,
        Some(previous.flag_id),
        detail,
    );
    Ok(StatusCode::NO_CONTENT)
}
