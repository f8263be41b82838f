//! # featuregate-engine
//!
//! Deterministic feature-flag evaluation.
//!
//! This crate is the pure core of the featuregate service: the domain
//! model (flags, variants, rules, overrides), context validation, the
//! rule condition evaluator, and the evaluation algorithm itself. It
//! performs no I/O - storage backends hand it a consistent snapshot and
//! it resolves a value plus an audit-grade reason.
//!
//! ## Evaluation order
//!
//! 1. Override for the calling user (expiry checked at read time)
//! 2. Disabled flag → default value
//! 3. Targeting rules, in `(priority, created_at, id)` order, each with
//!    an optional sticky percentage gate
//! 4. Percentage rollout gate over the assignment bucket
//! 5. Weighted variant selection
//! 6. Default value
//!
//! Assignment is sticky: rollout and variant decisions hash
//! `userId:flagKey` (murmur3, seed 0) into 10 000 buckets, so a
//! principal keeps its cohort across calls and restarts.
//!
//! ## Example
//!
//! ```rust
//! use chrono::Utc;
//! use featuregate_engine::{
//!     evaluate_flag, EvaluationContext, EvaluationOptions, EvaluationReason, Flag, FlagId,
//!     FlagType, FlagValue,
//! };
//!
//! let now = Utc::now();
//! let flag = Flag {
//!     id: FlagId::new(),
//!     key: "dark-mode".to_string(),
//!     name: "Dark mode".to_string(),
//!     description: None,
//!     flag_type: FlagType::Boolean,
//!     enabled: false,
//!     default_value: FlagValue::Bool(false),
//!     rollout_percentage: 100.0,
//!     organization_id: None,
//!     variants: Vec::new(),
//!     metadata: None,
//!     created_at: now,
//!     updated_at: now,
//! };
//!
//! let ctx = EvaluationContext::new().with_user_id("u1");
//! let result = evaluate_flag(&flag, &[], None, &ctx, &EvaluationOptions::default(), now);
//! assert_eq!(result.reason, EvaluationReason::Disabled);
//! ```

pub mod condition;
pub mod context;
pub mod error;
pub mod evaluate;
pub mod flag;
pub mod ident;
pub mod overrides;
pub mod rule;
pub mod validate;
pub mod value;

pub use condition::{CompositeCondition, Condition, LeafCondition, Operator};
pub use context::EvaluationContext;
pub use error::{ModelError, ValidationError};
pub use evaluate::{
    DisabledPrecedence, Evaluation, EvaluationOptions, EvaluationReason, evaluate_flag,
};
pub use flag::{Flag, Variant, validate_variants};
pub use ident::{
    ASSIGNMENT_BUCKETS, AuditId, EnvironmentId, EvaluationId, EventId, FlagId, OverrideId, RuleId,
    assignment_bucket, assignment_hash,
};
pub use overrides::Override;
pub use rule::{Rule, sort_rules};
pub use validate::{
    AttributeLimits, HeaderRule, HeaderValueType, extract_header_attributes,
    header_attribute_key, validate_attributes,
};
pub use value::{FlagType, FlagValue};
