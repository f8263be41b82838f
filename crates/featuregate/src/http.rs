//! Request-level helpers shared across routes: client address
//! extraction, the deployment-ring header, response shaping, and
//! evaluation-context assembly.

use axum::http::HeaderMap;
use featuregate_engine::{EvaluationContext, extract_header_attributes, validate_attributes};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::ServiceOptions;
use crate::error::{ApiError, ErrorCode};
use crate::session::Session;

/// Headers consulted for the client address, in order; the first
/// comma-separated value of the first present header wins.
const CLIENT_IP_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"];

/// Deployment-ring header overriding the body `environment`.
pub const DEPLOYMENT_RING_HEADER: &str = "x-deployment-ring";
const DEPLOYMENT_RINGS: [&str; 3] = ["canary", "preview", "production"];

pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    for name in CLIENT_IP_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or_default().trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    None
}

/// The validated `x-deployment-ring` value, if present.
pub fn deployment_ring(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DEPLOYMENT_RING_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|ring| DEPLOYMENT_RINGS.contains(ring))
        .map(str::to_string)
}

pub fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Response projection requested by the caller.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Select {
    #[default]
    Full,
    ValueOnly,
    Fields(Vec<String>),
}

/// Wire shape: `"full"`, `"value"`, or an explicit field list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SelectWire {
    Named(String),
    Fields(Vec<String>),
}

impl TryFrom<SelectWire> for Select {
    type Error = ApiError;

    fn try_from(wire: SelectWire) -> Result<Self, Self::Error> {
        match wire {
            SelectWire::Named(name) => match name.as_str() {
                "full" => Ok(Select::Full),
                "value" => Ok(Select::ValueOnly),
                other => Err(ApiError::new(
                    ErrorCode::InvalidInput,
                    format!("unknown select {other:?}"),
                )),
            },
            SelectWire::Fields(fields) => Ok(Select::Fields(fields)),
        }
    }
}

pub fn parse_select(wire: Option<SelectWire>) -> Result<Select, ApiError> {
    wire.map(Select::try_from).transpose().map(Option::unwrap_or_default)
}

/// Projects a result envelope per the requested `select`.
pub fn shape(envelope: Value, select: &Select) -> Value {
    match select {
        Select::Full => envelope,
        Select::ValueOnly => envelope
            .as_object()
            .and_then(|object| object.get("value"))
            .cloned()
            .unwrap_or(Value::Null),
        Select::Fields(fields) => {
            let Some(object) = envelope.as_object() else {
                return envelope;
            };
            let mut out = Map::new();
            for field in fields {
                if let Some(value) = object.get(field) {
                    out.insert(field.clone(), value.clone());
                }
            }
            Value::Object(out)
        }
    }
}

/// Assembles the effective evaluation context for a request: the body
/// context, holes filled from the session, whitelisted headers folded
/// into attributes, and the whole thing validated.
pub fn build_context(
    body_context: Option<EvaluationContext>,
    session: Option<&Session>,
    headers: &HeaderMap,
    options: &ServiceOptions,
) -> Result<EvaluationContext, ApiError> {
    let mut context = body_context.unwrap_or_default();
    if let Some(session) = session {
        if context.user_id.is_none() {
            context.user_id = Some(session.user_id.clone());
        }
        if context.organization_id.is_none() {
            context.organization_id = session.organization_id.clone();
        }
        // in multi-tenant mode the session scope is authoritative
        if options.multi_tenant && session.organization_id.is_some() {
            context.organization_id = session.organization_id.clone();
        }
    }
    let extracted = extract_header_attributes(&options.header_rules, &header_pairs(headers));
    for (key, value) in extracted {
        context.attributes.entry(key).or_insert(value);
    }
    validate_attributes(&context.attributes, &options.attribute_limits)?;
    Ok(context)
}

/// Identity used for rate limiting: user when authenticated, client
/// address otherwise.
pub fn rate_principal(session: Option<&Session>, headers: &HeaderMap) -> String {
    session
        .map(|s| s.user_id.clone())
        .or_else(|| client_ip(headers))
        .unwrap_or_else(|| "anonymous".to_string())
}
