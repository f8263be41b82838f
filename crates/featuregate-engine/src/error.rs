use thiserror::Error;

/// Rejections produced while validating flag, rule, and override shapes
/// before they are persisted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("invalid flag key {0:?}: must match ^[A-Za-z0-9_-]+$")]
    InvalidFlagKey(String),
    #[error("default value is not compatible with flag type {0}")]
    IncompatibleDefault(String),
    #[error("rollout percentage {0} is outside [0, 100]")]
    InvalidRollout(f64),
    #[error("rule percentage {0} is outside [0, 100]")]
    InvalidPercentage(f64),
    #[error("variant weights sum to {0}, expected 100")]
    VariantWeightSum(f64),
    #[error("variant weight {0} is negative")]
    NegativeVariantWeight(f64),
    #[error("duplicate variant key {0:?}")]
    DuplicateVariant(String),
    #[error("variant value for {0:?} is not compatible with the flag type")]
    IncompatibleVariant(String),
}

/// Rejections produced by context attribute validation. Any of these maps
/// to the `VALIDATION_ERROR` wire code.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("attribute key {0:?} is not allowed")]
    ForbiddenKey(String),
    #[error("attribute key {0:?} does not match ^[A-Za-z0-9_.-]+$")]
    InvalidKey(String),
    #[error("attributes nest deeper than {max} levels")]
    TooDeep { max: usize },
    #[error("array under {key:?} has more than {max} elements")]
    ArrayTooLong { key: String, max: usize },
    #[error("object under {key:?} has more than {max} properties")]
    ObjectTooLarge { key: String, max: usize },
    #[error("string under {key:?} exceeds {max} bytes")]
    StringTooLong { key: String, max: usize },
    #[error("number under {key:?} is not finite")]
    NonFiniteNumber { key: String },
    #[error("serialized attributes exceed {max} bytes")]
    AttributesTooLarge { max: usize },
}
