//! Admin observability: audit listings, per-flag stats, usage rollups,
//! and data export.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use featuregate_engine::{AuditId, FlagId};
use featuregate_store::{
    AuditAction, AuditFilter, DateRange, FlagQuery, Granularity, StatMetric, StatsQuery,
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{authorize, owned_flag};
use crate::error::{ApiError, ErrorCode};
use crate::state::AppState;

/// Longest window a stats query may span.
const MAX_STATS_WINDOW_DAYS: i64 = 90;
const DEFAULT_STATS_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsParams {
    #[serde(default)]
    pub granularity: Option<Granularity>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timezone: Option<String>,
    /// Comma-separated metric names (`totalEvaluations,uniqueUsers`).
    #[serde(default)]
    pub metrics: Option<String>,
}

/// Parses a timezone expressed as `UTC` or a fixed `±HH:MM` offset.
fn parse_timezone(raw: &str) -> Result<i32, ApiError> {
    if raw.eq_ignore_ascii_case("utc") || raw == "Z" {
        return Ok(0);
    }
    let invalid = || {
        ApiError::new(
            ErrorCode::InvalidInput,
            format!("timezone must be UTC or a ±HH:MM offset, got {raw:?}"),
        )
    };
    let (sign, rest) = match raw.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    Ok(sign * (hours * 60 + minutes))
}

fn parse_metrics(raw: &str) -> Result<Vec<StatMetric>, ApiError> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            serde_json::from_value(Value::String(name.to_string())).map_err(|_| {
                ApiError::new(
                    ErrorCode::InvalidInput,
                    format!("unknown metric {name:?}"),
                )
            })
        })
        .collect()
}

fn resolve_range(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<DateRange, ApiError> {
    let end = end.unwrap_or_else(Utc::now);
    let start = start.unwrap_or(end - Duration::days(DEFAULT_STATS_WINDOW_DAYS));
    if start >= end {
        return Err(ApiError::new(
            ErrorCode::InvalidDateRange,
            "start must precede end",
        ));
    }
    let range = DateRange { start, end };
    if range.duration_days() > MAX_STATS_WINDOW_DAYS {
        return Err(ApiError::new(
            ErrorCode::DateRangeTooLarge,
            format!("window exceeds {MAX_STATS_WINDOW_DAYS} days"),
        ));
    }
    Ok(range)
}

pub async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(flag_id): Path<String>,
    Query(params): Query<StatsParams>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let flag_id: FlagId = super::parse_id(&flag_id, ApiError::flag_not_found())?;
    let flag = owned_flag(&state, &admin, flag_id).await?;

    let range = resolve_range(params.start, params.end)?;
    let metrics = params.metrics.as_deref().map(parse_metrics).transpose()?;
    let utc_offset_minutes = params
        .timezone
        .as_deref()
        .map(parse_timezone)
        .transpose()?
        .unwrap_or(0);
    let query = StatsQuery {
        range: Some(range),
        metrics,
        granularity: params.granularity,
        utc_offset_minutes,
    };
    let stats = state.store.evaluation_stats(flag.id, &query).await?;
    Ok(Json(json!({
        "flagId": flag.id,
        "flagKey": flag.key,
        "start": range.start.to_rfc3339_opts(SecondsFormat::Millis, true),
        "end": range.end.to_rfc3339_opts(SecondsFormat::Millis, true),
        "stats": stats,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageParams {
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

pub async fn usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UsageParams>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, params.organization_id.as_deref())?;
    let range = match (params.start, params.end) {
        (None, None) => None,
        (start, end) => Some(resolve_range(start, end)?),
    };
    let usage = state
        .store
        .usage_metrics(admin.scope.as_deref(), range)
        .await?;
    Ok(Json(serde_json::to_value(&usage).unwrap_or(Value::Null)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditParams {
    #[serde(default)]
    pub flag_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub action: Option<AuditAction>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AuditParams>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let flag_id = params
        .flag_id
        .as_deref()
        .map(|raw| super::parse_id::<FlagId>(raw, ApiError::flag_not_found()))
        .transpose()?;
    let range = match (params.start, params.end) {
        (None, None) => None,
        (start, end) => Some(resolve_range(start, end)?),
    };
    let filter = AuditFilter {
        flag_id,
        user_id: params.user_id,
        action: params.action,
        // tenants only see their own trail
        organization_id: admin.scope.clone(),
        range,
        limit: Some(params.limit.unwrap_or(50).min(500)),
        offset: params.offset.unwrap_or(0),
    };
    let entries = state.store.audit_logs(&filter).await?;
    Ok(Json(json!({ "entries": entries })))
}

pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let not_found = || ApiError::new(ErrorCode::AuditNotFound, "audit entry not found");
    let id: AuditId = super::parse_id(&id, not_found())?;
    let entry = state.store.audit_by_id(id).await?.ok_or_else(not_found)?;
    if state.options.multi_tenant && entry.organization_id != admin.scope {
        return Err(not_found());
    }
    Ok(Json(serde_json::to_value(&entry).unwrap_or(Value::Null)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBody {
    #[serde(default = "default_true")]
    pub include_rules: bool,
    #[serde(default = "default_true")]
    pub include_overrides: bool,
}

fn default_true() -> bool {
    true
}

/// Exports the caller's flag set (with rules and overrides) as a single
/// JSON document.
pub async fn export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ExportBody>,
) -> Result<Json<Value>, ApiError> {
    let admin = authorize(&state, &headers, None)?;
    let flags = state
        .store
        .list_flags(admin.scope.as_deref(), &FlagQuery::default())
        .await
        .map_err(|err| ApiError::new(ErrorCode::ExportError, err.to_string()))?;

    let mut exported = Vec::with_capacity(flags.len());
    for flag in &flags {
        let mut row = serde_json::to_value(flag).unwrap_or(Value::Null);
        if let Some(object) = row.as_object_mut() {
            if body.include_rules {
                let rules = state
                    .store
                    .rules_for_flag(flag.id)
                    .await
                    .map_err(|err| ApiError::new(ErrorCode::ExportError, err.to_string()))?;
                object.insert(
                    "rules".to_string(),
                    serde_json::to_value(&rules).unwrap_or(Value::Null),
                );
            }
            if body.include_overrides {
                let overrides = state
                    .store
                    .list_overrides(Some(flag.id), None)
                    .await
                    .map_err(|err| ApiError::new(ErrorCode::ExportError, err.to_string()))?;
                object.insert(
                    "overrides".to_string(),
                    serde_json::to_value(&overrides).unwrap_or(Value::Null),
                );
            }
        }
        exported.push(row);
    }
    Ok(Json(json!({
        "version": 1,
        "exportedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "organizationId": admin.scope,
        "flags": exported,
    })))
}
