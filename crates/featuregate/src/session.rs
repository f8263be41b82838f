//! The session shape the host authentication framework provides.
//!
//! The service never authenticates anything itself: the host hands it
//! a [`SessionResolver`] that can turn request headers into a
//! [`Session`]. Public endpoints tolerate an absent session; the admin
//! surface requires one.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// An authenticated principal, as resolved by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
}

impl Session {
    pub fn has_any_role(&self, roles: &[String]) -> bool {
        self.roles.iter().any(|role| roles.contains(role))
    }
}

/// Resolves the session for a request. Implemented by the host.
pub trait SessionResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<Session>;
}

/// Resolver for deployments without authentication: every request is
/// anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSessionResolver;

impl SessionResolver for NoSessionResolver {
    fn resolve(&self, _headers: &HeaderMap) -> Option<Session> {
        None
    }
}

/// Resolves every request to the same session; handy in tests and
/// single-user tools.
#[derive(Debug, Clone)]
pub struct StaticSessionResolver {
    pub session: Session,
}

impl SessionResolver for StaticSessionResolver {
    fn resolve(&self, _headers: &HeaderMap) -> Option<Session> {
        Some(self.session.clone())
    }
}

impl<F> SessionResolver for F
where
    F: Fn(&HeaderMap) -> Option<Session> + Send + Sync,
{
    fn resolve(&self, headers: &HeaderMap) -> Option<Session> {
        self(headers)
    }
}
