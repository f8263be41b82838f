//! List queries, pagination cursors, and date ranges.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use featuregate_engine::FlagType;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Sort field for flag listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagOrderBy {
    Key,
    Name,
    #[default]
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// Options for `list_flags`. Listings are deterministic: equal sort
/// keys are tie-broken by id so pages never overlap or skip.
#[derive(Debug, Clone, Default)]
pub struct FlagQuery {
    pub limit: Option<usize>,
    pub offset: usize,
    pub order_by: FlagOrderBy,
    pub order_direction: OrderDirection,
    pub flag_type: Option<FlagType>,
    pub enabled: Option<bool>,
    pub key_prefix: Option<String>,
    /// Substring search over key and name.
    pub search: Option<String>,
}

/// Opaque pagination cursor: a base64 wrapper over the next offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub offset: usize,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let payload = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(payload)
    }

    pub fn decode(raw: &str) -> Result<Self, StoreError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| StoreError::InvalidInput("malformed cursor".to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| StoreError::InvalidInput("malformed cursor".to_string()))
    }
}

/// A half-open UTC time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    pub fn duration_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip() {
        let cursor = Cursor { offset: 250 };
        let encoded = cursor.encode();
        assert_eq!(Cursor::decode(&encoded).unwrap(), cursor);
    }

    #[test]
    fn test_malformed_cursor_rejected() {
        assert!(matches!(
            Cursor::decode("not base64!!"),
            Err(StoreError::InvalidInput(_))
        ));
        let garbage = URL_SAFE_NO_PAD.encode(b"{\"nope\":1}");
        assert!(Cursor::decode(&garbage).is_err());
    }
}
