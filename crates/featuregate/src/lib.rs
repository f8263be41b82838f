//! # featuregate
//!
//! A feature-flag evaluation service: a request-scoped decision engine
//! that resolves a flag key and an evaluation context into a typed
//! value with an audit-grade reason, plus the HTTP surface, caching,
//! admin enforcement, and analytics recording around it.
//!
//! ## Architecture
//!
//! * [`featuregate_engine`] - the pure evaluation core
//! * [`featuregate_store`] - the storage contract with memory and
//!   SQLite backends
//! * this crate - the service: axum routes, the LRU+TTL evaluation
//!   cache with flag-scoped invalidation, admin gates, fire-and-forget
//!   audit/analytics recording, rate limiting, and idempotent event
//!   intake
//!
//! Construction is two-phase: build a store, then an [`AppState`], then
//! mount the router wherever the host keeps its routes.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use featuregate::{AppState, NoSessionResolver, ServiceOptions, router};
//! use featuregate_store::{MemoryStore, UnknownFlagPolicy};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryStore::new(UnknownFlagPolicy::Log));
//!     let state = AppState::new(store, Arc::new(NoSessionResolver), ServiceOptions::default());
//!     let app = axum::Router::new().nest("/feature-flags", router(state));
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8017").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```
//!
//! ## Configuration
//!
//! Every option can be set in code via [`ServiceOptions`]; `Default`
//! fills the rest from environment variables (constructor options take
//! priority):
//!
//! | Option | Env Variable | Default |
//! |--------|--------------|---------|
//! | Admin roles | FEATUREGATE_ADMIN_ROLES | `admin` |
//! | Admin surface enabled | FEATUREGATE_ADMIN | true |
//! | Multi-tenant scoping | FEATUREGATE_MULTI_TENANT | false |
//! | Track evaluations | FEATUREGATE_TRACK_USAGE | true |
//! | Audit log | FEATUREGATE_AUDIT | true |
//! | Audit retention (days) | FEATUREGATE_AUDIT_RETENTION_DAYS | 90 |
//! | Cache enabled | FEATUREGATE_CACHE | true |
//! | Cache TTL (seconds) | FEATUREGATE_CACHE_TTL | 60 |
//! | Max cache size | FEATUREGATE_MAX_CACHE_SIZE | 1000 |
//! | Rate limiting | FEATUREGATE_RATE_LIMIT | true |
//! | Evaluate budget (per min) | FEATUREGATE_RATE_LIMIT_EVALUATE | 100 |
//! | Batch budget (per min) | FEATUREGATE_RATE_LIMIT_BATCH | 1000 |
//! | Events budget (per min) | FEATUREGATE_RATE_LIMIT_EVENTS | 600 |
//! | Admin budget (per min) | FEATUREGATE_RATE_LIMIT_ADMIN | 20 |
//! | Recorder queue capacity | FEATUREGATE_RECORDER_CAPACITY | 1024 |
//! | Idempotency TTL (seconds) | FEATUREGATE_IDEMPOTENCY_TTL | 86400 |

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod idempotency;
pub mod rate_limit;
pub mod recorder;
pub mod routes;
pub mod session;
pub mod state;

pub use cache::{BOOTSTRAP_KEY, CacheStats, EvaluationCache};
pub use config::{CacheSettings, RateLimitSettings, ServiceOptions, default_header_rules};
pub use error::{ApiError, ErrorCode};
pub use idempotency::IdempotencyStore;
pub use rate_limit::{RateClass, RateLimiter};
pub use recorder::Recorder;
pub use routes::router;
pub use session::{NoSessionResolver, Session, SessionResolver, StaticSessionResolver};
pub use state::AppState;
