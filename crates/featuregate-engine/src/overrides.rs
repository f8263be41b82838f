use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ident::{FlagId, OverrideId};
use crate::value::FlagValue;

/// A per-user pinned value for a flag, optionally time-bounded.
/// `(flag_id, user_id)` is unique; expiry is checked at read time, no
/// background sweeper is involved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Override {
    pub id: OverrideId,
    pub flag_id: FlagId,
    pub user_id: String,
    pub value: FlagValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Override {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry_is_checked_against_now() {
        let now = Utc::now();
        let mut o = Override {
            id: OverrideId::new(),
            flag_id: FlagId::new(),
            user_id: "u42".to_string(),
            value: FlagValue::Bool(true),
            variant: None,
            expires_at: None,
            reason: None,
            created_at: now,
        };
        assert!(!o.is_expired(now));

        o.expires_at = Some(now + Duration::hours(1));
        assert!(!o.is_expired(now));

        o.expires_at = Some(now - Duration::seconds(1));
        assert!(o.is_expired(now));
    }
}
