//! Admin environment bookkeeping.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use featuregate_engine::EnvironmentId;
use featuregate_store::{AuditAction, EnvironmentUpdate, NewEnvironment};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{authorize, record_audit};
use crate::error::{ApiError, ErrorCode};
use crate::state::AppState;

fn environment_not_found() -> ApiError {
    ApiError::new(ErrorCode::FlagNotFound, "environment not found")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentBody {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let environments = state.store.list_environments(admin.scope.as_deref()).await?;
    Ok(Json(json!({ "environments": environments })))
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EnvironmentBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let environment = state
        .store
        .create_environment(NewEnvironment {
            key: body.key,
            name: body.name,
            description: body.description,
            organization_id: admin.scope.clone(),
        })
        .await?;

    let mut detail = Map::new();
    detail.insert(
        "newValue".to_string(),
        serde_json::to_value(&environment).unwrap_or(Value::Null),
    );
    record_audit(
        &state,
        &admin,
        &headers,
        "POST",
        "/admin/environments".to_string(),
        AuditAction::Created,
        None,
        detail,
    );
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(&environment).unwrap_or(Value::Null)),
    ))
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<EnvironmentUpdate>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let id: EnvironmentId = super::parse_id(&id, environment_not_found())?;
    let previous = state
        .store
        .environment_by_id(id)
        .await?
        .ok_or_else(environment_not_found)?;
    if state.options.multi_tenant && previous.organization_id != admin.scope {
        return Err(environment_not_found());
    }
    let updated = state.store.update_environment(id, body).await?;

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
        format!("/admin/environments/{id}"),
        AuditAction::Updated,
        None,
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
    let id: EnvironmentId = super::parse_id(&id, environment_not_found())?;
    let previous = state
        .store
        .environment_by_id(id)
        .await?
        .ok_or_else(environment_not_found)?;
    if state.options.multi_tenant && previous.organization_id != admin.scope {
        return Err(environment_not_found());
    }
    state.store.delete_environment(id).await?;

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
        format!("/admin/environments/{id}"),
        AuditAction::Deleted,
        None,
        detail,
    );
    Ok(StatusCode::NO_CONTENT)
}
