//! Admin flag CRUD plus enable/disable.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use featuregate_engine::{FlagId, FlagType};
use featuregate_store::{
    AuditAction, Cursor, FlagOrderBy, FlagQuery, FlagUpdate, NewFlag, OrderDirection, StatsQuery,
};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{authorize, owned_flag, record_audit};
use crate::error::{ApiError, ErrorCode};
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Substring search over key and name.
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub sort: Option<FlagOrderBy>,
    #[serde(default)]
    pub order: Option<OrderDirection>,
    #[serde(default, rename = "type")]
    pub flag_type: Option<FlagType>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub include: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, params.organization_id.as_deref())?;
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(ApiError::new(
            ErrorCode::InvalidInput,
            format!("limit must be within 1..={MAX_PAGE_SIZE}"),
        ));
    }
    let offset = match &params.cursor {
        Some(cursor) => Cursor::decode(cursor)?.offset,
        None => 0,
    };
    let query = FlagQuery {
        // one extra row decides hasMore without a second count query
        limit: Some(limit + 1),
        offset,
        order_by: params.sort.unwrap_or_default(),
        order_direction: params.order.unwrap_or_default(),
        flag_type: params.flag_type,
        enabled: params.enabled,
        key_prefix: params.prefix,
        search: params.q,
    };
    let mut flags = state.store.list_flags(admin.scope.as_deref(), &query).await?;
    let has_more = flags.len() > limit;
    flags.truncate(limit);

    let with_stats = params.include.as_deref() == Some("stats");
    let mut rows = Vec::with_capacity(flags.len());
    for flag in &flags {
        let mut row = serde_json::to_value(flag).unwrap_or(Value::Null);
        if with_stats {
            let stats = state
                .store
                .evaluation_stats(flag.id, &StatsQuery::default())
                .await?;
            if let Some(object) = row.as_object_mut() {
                object.insert(
                    "stats".to_string(),
                    serde_json::to_value(&stats).unwrap_or(Value::Null),
                );
            }
        }
        rows.push(row);
    }

    let next_cursor = has_more.then(|| {
        Cursor {
            offset: offset + limit,
        }
        .encode()
    });
    Ok(Json(json!({
        "flags": rows,
        "page": {
            "nextCursor": next_cursor,
            "limit": limit,
            "hasMore": has_more,
        },
    })))
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut body): Json<NewFlag>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let admin = authorize(&state, &headers, body.organization_id.as_deref())?;
    if state.options.multi_tenant {
        body.organization_id = admin.scope.clone();
    }
    let flag = state.store.create_flag(body).await?;
    state.cache.invalidate_flag(&flag.key);

    let mut detail = Map::new();
    detail.insert(
        "newValue".to_string(),
        serde_json::to_value(&flag).unwrap_or(Value::Null),
    );
    record_audit(
        &state,
        &admin,
        &headers,
        "POST",
        "/admin/flags".to_string(),
        AuditAction::Created,
        Some(flag.id),
        detail,
    );
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(&flag).unwrap_or(Value::Null)),
    ))
}

pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let id: FlagId = super::parse_id(&id, ApiError::flag_not_found())?;
    let flag = owned_flag(&state, &admin, id).await?;
    let rules = state.store.rules_for_flag(flag.id).await?;
    let mut body = serde_json::to_value(&flag).unwrap_or(Value::Null);
    if let Some(object) = body.as_object_mut() {
        object.insert(
            "rules".to_string(),
            serde_json::to_value(&rules).unwrap_or(Value::Null),
        );
    }
    Ok(Json(body))
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<FlagUpdate>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let id: FlagId = super::parse_id(&id, ApiError::flag_not_found())?;
    let previous = owned_flag(&state, &admin, id).await?;
    let updated = state.store.update_flag(id, body).await?;
    state.cache.invalidate_flag(&updated.key);

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
        format!("/admin/flags/{id}"),
        AuditAction::Updated,
        Some(id),
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
    let id: FlagId = super::parse_id(&id, ApiError::flag_not_found())?;
    let previous = owned_flag(&state, &admin, id).await?;
    state.store.delete_flag(id).await?;
    state.cache.invalidate_flag(&previous.key);

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
        format!("/admin/flags/{id}"),
        AuditAction::Deleted,
        Some(id),
        detail,
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn set_enabled(
    state: AppState,
    headers: HeaderMap,
    raw_id: String,
    enabled: bool,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let id: FlagId = super::parse_id(&raw_id, ApiError::flag_not_found())?;
    let previous = owned_flag(&state, &admin, id).await?;
    let update = FlagUpdate {
        enabled: Some(enabled),
        ..Default::default()
    };
    let updated = state.store.update_flag(id, update).await?;
    state.cache.invalidate_flag(&updated.key);

    let (action, verb) = if enabled {
        (AuditAction::Enabled, "enable")
    } else {
        (AuditAction::Disabled, "disable")
    };
    let mut detail = Map::new();
    detail.insert("previousValue".to_string(), json!(previous.enabled));
    detail.insert("newValue".to_string(), json!(enabled));
    record_audit(
        &state,
        &admin,
        &headers,
        "POST",
        format!("/admin/flags/{id}/{verb}"),
        action,
        Some(id),
        detail,
    );
    Ok(Json(serde_json::to_value(&updated).unwrap_or(Value::Null)))
}

pub async fn enable(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    set_enabled(state, headers, id, true).await
}

pub async fn disable(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    set_enabled(state, headers, id, false).await
}
