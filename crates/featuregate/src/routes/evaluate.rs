//! Public evaluation endpoints: single, batch, and bootstrap.
//!
//! Evaluation degrades gracefully: a storage failure mid-request is
//! logged and answered with the safest value available (the caller's
//! default), never a 500. Tracking is enqueued after the response value
//! is known and can never fail the request.

use std::collections::BTreeMap;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::{SecondsFormat, Utc};
use featuregate_engine::{
    Evaluation, EvaluationContext, EvaluationOptions, EvaluationReason, Flag, FlagValue,
    evaluate_flag,
};
use featuregate_store::{FlagQuery, NewEvaluationRecord};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::cache::BOOTSTRAP_KEY;
use crate::error::{ApiError, ErrorCode};
use crate::http::{
    Select, SelectWire, build_context, deployment_ring, parse_select, rate_principal, shape,
};
use crate::rate_limit::RateClass;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    pub flag_key: String,
    #[serde(default)]
    pub context: Option<EvaluationContext>,
    #[serde(default)]
    pub default: Option<FlagValue>,
    #[serde(default)]
    pub select: Option<SelectWire>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub track: Option<bool>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub context_in_response: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateBatchRequest {
    pub flag_keys: Vec<String>,
    #[serde(default)]
    pub defaults: Option<BTreeMap<String, FlagValue>>,
    #[serde(default)]
    pub context: Option<EvaluationContext>,
    #[serde(default)]
    pub select: Option<SelectWire>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub track: Option<bool>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub context_in_response: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    #[serde(default)]
    pub context: Option<EvaluationContext>,
    /// Restrict to these keys (server still filters to enabled flags).
    #[serde(default)]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub select: Option<SelectWire>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub track: Option<bool>,
    #[serde(default)]
    pub debug: Option<bool>,
}

/// Evaluates one flag with per-stage degradation; never errors.
async fn evaluate_key(
    state: &AppState,
    flag: &Flag,
    context: &EvaluationContext,
    options: &EvaluationOptions,
) -> Evaluation {
    let rules = match state.store.rules_for_flag(flag.id).await {
        Ok(rules) => rules,
        Err(err) => {
            warn!(flag = %flag.key, "rule fetch failed, evaluating without rules: {err}");
            Vec::new()
        }
    };
    let user_override = match &context.user_id {
        Some(user_id) => match state.store.override_for(flag.id, user_id).await {
            Ok(found) => found,
            Err(err) => {
                warn!(flag = %flag.key, "override fetch failed, ignoring: {err}");
                None
            }
        },
        None => None,
    };
    evaluate_flag(
        flag,
        &rules,
        user_override.as_ref(),
        context,
        options,
        Utc::now(),
    )
}

fn engine_options(state: &AppState, debug: bool, environment: Option<&str>) -> EvaluationOptions {
    EvaluationOptions {
        debug,
        environment: environment.map(str::to_string),
        disabled_precedence: state.options.disabled_precedence,
    }
}

fn track_evaluation(
    state: &AppState,
    track: Option<bool>,
    flag_key: &str,
    context: &EvaluationContext,
    evaluation: &Evaluation,
    latency_ms: f64,
) {
    if !state.options.track_usage || track == Some(false) {
        return;
    }
    state.recorder.record_evaluation(NewEvaluationRecord {
        flag_key: flag_key.to_string(),
        organization_id: context.organization_id.clone(),
        user_id: context.user_id.clone(),
        value: evaluation.value.clone(),
        variant: evaluation.variant.clone(),
        reason: evaluation.reason,
        context: serde_json::to_value(context).unwrap_or(Value::Null),
        latency_ms: Some(latency_ms),
        error: false,
    });
}

fn result_object(evaluation: &Evaluation) -> Value {
    serde_json::to_value(evaluation).unwrap_or(Value::Null)
}

fn now_rfc3339() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn check_flag_key(key: &str) -> Result<(), ApiError> {
    if Flag::validate_key(key) {
        Ok(())
    } else {
        Err(ApiError::new(
            ErrorCode::InvalidInput,
            format!("invalid flag key {key:?}"),
        ))
    }
}

pub async fn evaluate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EvaluateRequest>,
) -> Result<Json<Value>, ApiError> {
    let started = Instant::now();
    let session = state.sessions.resolve(&headers);
    state
        .limiter
        .check(RateClass::Evaluate, &rate_principal(session.as_ref(), &headers))?;
    check_flag_key(&body.flag_key)?;
    let select = parse_select(body.select)?;
    let debug = body.debug.unwrap_or(false);
    let context = build_context(body.context, session.as_ref(), &headers, &state.options)?;
    let environment = deployment_ring(&headers).or(body.environment);

    let cached = if debug {
        None
    } else {
        state
            .cache
            .get(&body.flag_key, &context, environment.as_deref())
            .and_then(|payload| serde_json::from_value::<Evaluation>(payload).ok())
    };

    let evaluation = match cached {
        Some(evaluation) => evaluation,
        None => {
            let options = engine_options(&state, debug, environment.as_deref());
            let evaluation = match state
                .store
                .flag_by_key(&body.flag_key, context.organization_id.as_deref())
                .await
            {
                Ok(Some(flag)) => evaluate_key(&state, &flag, &context, &options).await,
                Ok(None) => Evaluation::not_found(body.default.clone()),
                Err(err) => {
                    // storage failure: answer with the caller default
                    warn!(flag = %body.flag_key, "flag fetch failed, serving default: {err}");
                    Evaluation {
                        value: body.default.clone().unwrap_or(FlagValue::Json(Value::Null)),
                        variant: None,
                        reason: EvaluationReason::Default,
                        metadata: None,
                    }
                }
            };
            if !debug {
                state.cache.insert(
                    &body.flag_key,
                    &context,
                    environment.as_deref(),
                    result_object(&evaluation),
                    None,
                );
            }
            evaluation
        }
    };

    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    track_evaluation(&state, body.track, &body.flag_key, &context, &evaluation, latency_ms);

    let mut envelope = result_object(&evaluation);
    if let Some(object) = envelope.as_object_mut() {
        object.insert("evaluatedAt".to_string(), now_rfc3339());
        if body.context_in_response.unwrap_or(true) {
            object.insert(
                "context".to_string(),
                serde_json::to_value(&context).unwrap_or(Value::Null),
            );
        }
    }
    Ok(Json(shape(envelope, &select)))
}

pub async fn evaluate_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EvaluateBatchRequest>,
) -> Result<Json<Value>, ApiError> {
    let started = Instant::now();
    let session = state.sessions.resolve(&headers);
    state.limiter.check(
        RateClass::EvaluateBatch,
        &rate_principal(session.as_ref(), &headers),
    )?;
    if body.flag_keys.is_empty() {
        return Err(ApiError::new(ErrorCode::InvalidInput, "flagKeys is empty"));
    }
    for key in &body.flag_keys {
        check_flag_key(key)?;
    }
    let select = parse_select(body.select)?;
    let debug = body.debug.unwrap_or(false);
    let context = build_context(body.context, session.as_ref(), &headers, &state.options)?;
    let environment = deployment_ring(&headers).or(body.environment);
    let options = engine_options(&state, debug, environment.as_deref());
    let defaults = body.defaults.unwrap_or_default();

    // one storage round trip for the whole batch
    let fetched = state
        .store
        .flags_by_keys(&body.flag_keys, context.organization_id.as_deref())
        .await
        .unwrap_or_else(|err| {
            warn!("batch flag fetch failed, serving defaults: {err}");
            Vec::new()
        });
    let by_key: BTreeMap<&str, &Flag> =
        fetched.iter().map(|flag| (flag.key.as_str(), flag)).collect();

    let mut flags = Map::new();
    for key in &body.flag_keys {
        let evaluation = match by_key.get(key.as_str()) {
            Some(flag) => {
                let cached = if debug {
                    None
                } else {
                    state
                        .cache
                        .get(key, &context, environment.as_deref())
                        .and_then(|payload| serde_json::from_value::<Evaluation>(payload).ok())
                };
                match cached {
                    Some(evaluation) => evaluation,
                    None => {
                        let evaluation = evaluate_key(&state, flag, &context, &options).await;
                        if !debug {
                            state.cache.insert(
                                key,
                                &context,
                                environment.as_deref(),
                                result_object(&evaluation),
                                None,
                            );
                        }
                        evaluation
                    }
                }
            }
            // a missing key falls back to the caller's default for that
            // key, otherwise surfaces not_found
            None => match defaults.get(key) {
                Some(default) => Evaluation {
                    value: default.clone(),
                    variant: None,
                    reason: EvaluationReason::Default,
                    metadata: None,
                },
                None => Evaluation::not_found(None),
            },
        };
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        track_evaluation(&state, body.track, key, &context, &evaluation, latency_ms);
        flags.insert(key.clone(), shape(result_object(&evaluation), &select));
    }

    let mut envelope = Map::new();
    envelope.insert("flags".to_string(), Value::Object(flags));
    envelope.insert("evaluatedAt".to_string(), now_rfc3339());
    if body.context_in_response.unwrap_or(true) {
        envelope.insert(
            "context".to_string(),
            serde_json::to_value(&context).unwrap_or(Value::Null),
        );
    }
    Ok(Json(Value::Object(envelope)))
}

pub async fn bootstrap(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BootstrapRequest>,
) -> Result<Json<Value>, ApiError> {
    let started = Instant::now();
    let session = state.sessions.resolve(&headers);
    state.limiter.check(
        RateClass::EvaluateBatch,
        &rate_principal(session.as_ref(), &headers),
    )?;
    let select = parse_select(body.select)?;
    let debug = body.debug.unwrap_or(false);
    let context = build_context(body.context, session.as_ref(), &headers, &state.options)?;
    let environment = deployment_ring(&headers).or(body.environment);
    let options = engine_options(&state, debug, environment.as_deref());

    // the whole-response cache only serves the unfiltered, unprojected
    // shape
    let cacheable =
        !debug && body.include.is_none() && body.prefix.is_none() && select == Select::Full;
    if cacheable {
        if let Some(cached) = state
            .cache
            .get(BOOTSTRAP_KEY, &context, environment.as_deref())
        {
            return Ok(Json(cached));
        }
    }

    let query = FlagQuery {
        enabled: Some(true),
        key_prefix: body.prefix.clone(),
        ..Default::default()
    };
    let enabled_flags = state
        .store
        .list_flags(context.organization_id.as_deref(), &query)
        .await
        .unwrap_or_else(|err| {
            warn!("bootstrap listing failed, serving empty set: {err}");
            Vec::new()
        });

    let mut flags = Map::new();
    for flag in &enabled_flags {
        if let Some(include) = &body.include {
            if !include.contains(&flag.key) {
                continue;
            }
        }
        let evaluation = evaluate_key(&state, flag, &context, &options).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        track_evaluation(&state, body.track, &flag.key, &context, &evaluation, latency_ms);
        flags.insert(flag.key.clone(), shape(result_object(&evaluation), &select));
    }

    let mut envelope = Map::new();
    envelope.insert("flags".to_string(), Value::Object(flags));
    envelope.insert("evaluatedAt".to_string(), now_rfc3339());
    envelope.insert(
        "context".to_string(),
        serde_json::to_value(&context).unwrap_or(Value::Null),
    );
    let payload = Value::Object(envelope);
    if cacheable {
        state.cache.insert(
            BOOTSTRAP_KEY,
            &context,
            environment.as_deref(),
            payload.clone(),
            None,
        );
    }
    Ok(Json(payload))
}
