use featuregate_engine::ModelError;
use thiserror::Error;

/// Failures surfaced by storage backends. The service layer maps these
/// onto wire codes (`CONFLICT`, `FLAG_NOT_FOUND`, `STORAGE_ERROR`, …).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("flag not found")]
    FlagNotFound,
    #[error("rule not found")]
    RuleNotFound,
    #[error("override not found")]
    OverrideNotFound,
    #[error("audit entry not found")]
    AuditNotFound,
    #[error("environment not found")]
    EnvironmentNotFound,
    /// `(organization, key)` uniqueness violation.
    #[error("duplicate key {0:?} in scope")]
    Conflict(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A value (default or variant) incompatible with the flag's type.
    #[error("invalid flag type: {0}")]
    InvalidFlagType(String),
    /// Unknown flag key rejected under the `throw` tracking policy.
    #[error("unknown flag key {0:?}")]
    UnknownFlag(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<ModelError> for StoreError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::IncompatibleDefault(_) | ModelError::IncompatibleVariant(_) => {
                StoreError::InvalidFlagType(err.to_string())
            }
            other => StoreError::InvalidInput(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(format!("serialization: {err}"))
    }
}
