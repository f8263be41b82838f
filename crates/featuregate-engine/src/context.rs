//! Request-scoped evaluation context.
//!
//! A context lives for a single request. Rule conditions resolve dotted
//! attribute paths against the JSON document produced by
//! [`EvaluationContext::to_document`], which exposes both the flat field
//! names (`userId`, `role`, …) and a nested `user` object so rules can
//! use either spelling.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Context passed by callers for flag evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvaluationContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Stable session identifier; the assignment fallback when no user
    /// id is present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_organization_id(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// The identifier sticky assignment hashes on: the user id, falling
    /// back to the session id. `None` means assignment is non-sticky and
    /// the principal stays out of percentage rollouts.
    pub fn sticky_key(&self) -> Option<&str> {
        self.user_id.as_deref().or(self.session_id.as_deref())
    }

    /// Builds the JSON document rule condition paths resolve against.
    pub fn to_document(&self) -> Value {
        let mut root = Map::new();
        let mut user = Map::new();
        if let Some(user_id) = &self.user_id {
            root.insert("userId".to_string(), Value::String(user_id.clone()));
            user.insert("id".to_string(), Value::String(user_id.clone()));
        }
        if let Some(email) = &self.email {
            root.insert("email".to_string(), Value::String(email.clone()));
            user.insert("email".to_string(), Value::String(email.clone()));
        }
        if let Some(role) = &self.role {
            root.insert("role".to_string(), Value::String(role.clone()));
            user.insert("role".to_string(), Value::String(role.clone()));
        }
        if let Some(org) = &self.organization_id {
            root.insert("organizationId".to_string(), Value::String(org.clone()));
            user.insert("organizationId".to_string(), Value::String(org.clone()));
        }
        if let Some(session_id) = &self.session_id {
            root.insert("sessionId".to_string(), Value::String(session_id.clone()));
        }
        if !user.is_empty() {
            root.insert("user".to_string(), Value::Object(user));
        }
        root.insert(
            "attributes".to_string(),
            Value::Object(self.attributes.clone()),
        );
        Value::Object(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::resolve_path;
    use serde_json::json;

    #[test]
    fn test_document_exposes_both_spellings() {
        let ctx = EvaluationContext::new()
            .with_user_id("u7")
            .with_role("admin")
            .with_attribute("plan", json!("pro"));
        let doc = ctx.to_document();

        assert_eq!(resolve_path(&doc, "userId"), Some(&json!("u7")));
        assert_eq!(resolve_path(&doc, "user.id"), Some(&json!("u7")));
        assert_eq!(resolve_path(&doc, "user.role"), Some(&json!("admin")));
        assert_eq!(resolve_path(&doc, "attributes.plan"), Some(&json!("pro")));
        assert_eq!(resolve_path(&doc, "attributes.missing"), None);
    }

    #[test]
    fn test_sticky_key_prefers_user_id() {
        let ctx = EvaluationContext::new()
            .with_user_id("u7")
            .with_session_id("s1");
        assert_eq!(ctx.sticky_key(), Some("u7"));

        let ctx = EvaluationContext::new().with_session_id("s1");
        assert_eq!(ctx.sticky_key(), Some("s1"));

        assert_eq!(EvaluationContext::new().sticky_key(), None);
    }

    #[test]
    fn test_wire_shape_is_camel_case() {
        let ctx: EvaluationContext = serde_json::from_value(json!({
            "userId": "u1",
            "organizationId": "org-1",
            "attributes": {"plan": "free"}
        }))
        .unwrap();
        assert_eq!(ctx.user_id.as_deref(), Some("u1"));
        assert_eq!(ctx.organization_id.as_deref(), Some("org-1"));
    }
}
