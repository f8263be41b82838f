//! Public capability descriptor and health probe.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::state::AppState;

const CONFIG_CACHE_CONTROL: &str = "public, max-age=300, stale-while-revalidate=60";

fn descriptor(state: &AppState) -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "evaluation": {
            "stickyAssignment": true,
            "cacheTtlSeconds": state.options.cache.ttl.as_secs(),
            "batchSupported": true,
            "bootstrapSupported": true,
        },
        "multiTenant": state.options.multi_tenant,
        "analytics": {
            "trackUsage": state.options.track_usage,
            "eventsBatchLimit": 100,
        },
        "endpoints": [
            "/evaluate",
            "/evaluate-batch",
            "/bootstrap",
            "/events",
            "/events/batch",
            "/config",
            "/health",
        ],
    })
}

/// Public-safe capability descriptor, ETag-validated.
pub async fn config_descriptor(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let body = descriptor(&state);
    let serialized = body.to_string();
    let digest = Sha256::digest(serialized.as_bytes());
    let etag = format!(
        "\"{}\"",
        digest.iter().map(|b| format!("{b:02x}")).collect::<String>()
    );

    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|candidate| candidate == etag)
    {
        return (
            StatusCode::NOT_MODIFIED,
            [
                (header::ETAG, etag),
                (header::CACHE_CONTROL, CONFIG_CACHE_CONTROL.to_string()),
            ],
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [
            (header::ETAG, etag),
            (header::CACHE_CONTROL, CONFIG_CACHE_CONTROL.to_string()),
        ],
        Json(body),
    )
        .into_response()
}

/// Liveness/readiness: 200 while storage answers, 503 otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let storage_ok = state.store.healthy().await;
    let cache_stats = state.cache.stats();
    let dropped_events = state.recorder.dropped();

    let status = if !storage_ok {
        "unhealthy"
    } else if dropped_events > 0 {
        "degraded"
    } else {
        "healthy"
    };
    let body = json!({
        "status": status,
        "checks": {
            "storage": if storage_ok { "ok" } else { "failing" },
            "cache": cache_stats,
        },
        "droppedEvents": dropped_events,
    });
    let code = if storage_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}
