//! Event tracking endpoints with idempotency and client sample rates.

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use featuregate_engine::{EvaluationReason, EventId, Flag, FlagValue};
use featuregate_store::NewEvaluationRecord;
use rand::Rng;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{ApiError, ErrorCode};
use crate::http::rate_principal;
use crate::rate_limit::RateClass;
use crate::state::AppState;

const MAX_BATCH_EVENTS: usize = 100;
const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    pub flag_key: String,
    pub event: String,
    #[serde(default)]
    pub properties: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sample_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBatchRequest {
    pub events: Vec<EventRequest>,
    #[serde(default)]
    pub sample_rate: Option<f64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn check_sample_rate(rate: Option<f64>) -> Result<(), ApiError> {
    if let Some(rate) = rate {
        if !(0.0..=1.0).contains(&rate) || !rate.is_finite() {
            return Err(ApiError::new(
                ErrorCode::InvalidSampleRate,
                format!("sample rate {rate} is outside [0, 1]"),
            ));
        }
    }
    Ok(())
}

fn validate_event(event: &EventRequest) -> Result<(), ApiError> {
    if !Flag::validate_key(&event.flag_key) {
        return Err(ApiError::new(
            ErrorCode::InvalidInput,
            format!("invalid flag key {:?}", event.flag_key),
        ));
    }
    if event.event.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::InvalidInput, "event name is empty"));
    }
    check_sample_rate(event.sample_rate)
}

/// Applies the client-declared sample rate: true means keep.
fn sample(rate: Option<f64>) -> bool {
    match rate {
        None => true,
        Some(rate) => rand::thread_rng().r#gen::<f64>() < rate,
    }
}

fn record_event(
    state: &AppState,
    principal: Option<&str>,
    organization_id: Option<&str>,
    event: &EventRequest,
) {
    state.recorder.record_evaluation(NewEvaluationRecord {
        flag_key: event.flag_key.clone(),
        organization_id: organization_id.map(str::to_string),
        user_id: principal.map(str::to_string),
        value: FlagValue::Json(Value::Null),
        variant: None,
        reason: EvaluationReason::Default,
        context: json!({
            "event": event.event,
            "properties": event.properties,
            "timestamp": event.timestamp.map(|t| t.to_rfc3339()),
        }),
        latency_ms: None,
        error: false,
    });
}

pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EventRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = state.sessions.resolve(&headers);
    let principal = rate_principal(session.as_ref(), &headers);
    state.limiter.check(RateClass::Events, &principal)?;
    validate_event(&body)?;

    let event_id = EventId::new();
    if let Some(key) = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        if state.idempotency.seen(&principal, key) {
            return Ok(Json(json!({
                "success": true,
                "eventId": event_id.to_string(),
                "duplicate": true,
            })));
        }
    }

    let sampled = sample(body.sample_rate);
    if sampled {
        let organization_id = session.as_ref().and_then(|s| s.organization_id.as_deref());
        record_event(
            &state,
            session.as_ref().map(|s| s.user_id.as_str()),
            organization_id,
            &body,
        );
    }
    Ok(Json(json!({
        "success": true,
        "eventId": event_id.to_string(),
        "sampled": sampled,
    })))
}

pub async fn submit_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EventBatchRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = state.sessions.resolve(&headers);
    let principal = rate_principal(session.as_ref(), &headers);
    state.limiter.check(RateClass::Events, &principal)?;
    if body.events.is_empty() {
        return Err(ApiError::new(ErrorCode::InvalidInput, "events is empty"));
    }
    if body.events.len() > MAX_BATCH_EVENTS {
        return Err(ApiError::new(
            ErrorCode::InvalidInput,
            format!("batch exceeds {MAX_BATCH_EVENTS} events"),
        ));
    }
    check_sample_rate(body.sample_rate)?;

    let batch_id = EventId::new();
    let idempotency_key = body
        .idempotency_key
        .as_deref()
        .or_else(|| headers.get(IDEMPOTENCY_HEADER).and_then(|v| v.to_str().ok()));
    if let Some(key) = idempotency_key {
        if state.idempotency.seen(&principal, key) {
            return Ok(Json(json!({
                "success": 0,
                "failed": 0,
                "sampled": 0,
                "batchId": batch_id.to_string(),
                "duplicate": true,
            })));
        }
    }

    let organization_id = session
        .as_ref()
        .and_then(|s| s.organization_id.clone());
    let mut success = 0usize;
    let mut failed = 0usize;
    let mut sampled_count = 0usize;
    for event in &body.events {
        if validate_event(event).is_err() {
            failed += 1;
            continue;
        }
        let rate = event.sample_rate.or(body.sample_rate);
        if sample(rate) {
            record_event(
                &state,
                session.as_ref().map(|s| s.user_id.as_str()),
                organization_id.as_deref(),
                event,
            );
            sampled_count += 1;
        }
        success += 1;
    }
    Ok(Json(json!({
        "success": success,
        "failed": failed,
        "sampled": sampled_count,
        "batchId": batch_id.to_string(),
    })))
}
