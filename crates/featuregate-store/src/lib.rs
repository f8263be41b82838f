//! # featuregate-store
//!
//! Storage contract and backends for the featuregate service.
//!
//! The [`FlagStore`] trait is the only surface the service and engine
//! depend on; the [`MemoryStore`] is the reference implementation and
//! the [`SqliteStore`] persists the same semantics to disk. Backends
//! guarantee:
//!
//! * `(organization, key)` uniqueness for flags - a create into an
//!   occupied slot fails with [`StoreError::Conflict`]; the global
//!   scope (no organization) is a scope of its own
//! * deleting a flag cascades to its rules, overrides, and evaluation
//!   records, while audit entries survive with their `flag_id` intact
//! * rules come back in `(priority, created_at, id)` order
//! * listings are deterministic across pages
//! * tracked evaluations for unknown flag keys follow the configured
//!   [`UnknownFlagPolicy`]

pub mod analytics;
pub mod audit;
pub mod environment;
pub mod error;
pub mod memory;
pub mod query;
pub mod sqlite;
pub mod store;

pub use analytics::{
    EvaluationRecord, EvaluationStats, Granularity, NewEvaluationRecord, SeriesBucket, StatMetric,
    StatsQuery, UsageMetrics, aggregate_stats,
};
pub use audit::{AuditAction, AuditEntry, AuditFilter, NewAuditEntry};
pub use environment::{Environment, EnvironmentUpdate, NewEnvironment};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use query::{Cursor, DateRange, FlagOrderBy, FlagQuery, OrderDirection};
pub use sqlite::SqliteStore;
pub use store::{
    FlagStore, FlagUpdate, NewFlag, NewOverride, NewRule, OverrideUpdate, RuleUpdate,
    UNKNOWN_FLAG_KEY, UnknownFlagPolicy,
};
