//! Shared service state.
//!
//! Construction is two-phase and explicit: build the storage backend
//! first, hand it to [`AppState::new`] together with the host's session
//! resolver, then mount the router. Nothing here is global.

use std::sync::Arc;
use std::time::Duration;

use featuregate_store::FlagStore;
use tracing::{debug, warn};

use crate::cache::EvaluationCache;
use crate::config::ServiceOptions;
use crate::idempotency::IdempotencyStore;
use crate::rate_limit::RateLimiter;
use crate::recorder::Recorder;
use crate::session::SessionResolver;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FlagStore>,
    pub cache: Arc<EvaluationCache>,
    pub recorder: Recorder,
    pub idempotency: Arc<IdempotencyStore>,
    pub limiter: Arc<RateLimiter>,
    pub sessions: Arc<dyn SessionResolver>,
    pub options: Arc<ServiceOptions>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn FlagStore>,
        sessions: Arc<dyn SessionResolver>,
        options: ServiceOptions,
    ) -> Self {
        let cache = Arc::new(EvaluationCache::new(&options.cache));
        let recorder = Recorder::spawn(store.clone(), options.recorder_capacity);
        let idempotency = Arc::new(IdempotencyStore::new(options.idempotency_ttl));
        let limiter = Arc::new(RateLimiter::new(options.rate_limits.clone()));
        let state = Self {
            store,
            cache,
            recorder,
            idempotency,
            limiter,
            sessions,
            options: Arc::new(options),
        };
        if state.options.audit_enabled {
            state.spawn_audit_cleanup();
        }
        state
    }

    /// Daily audit retention sweep.
    fn spawn_audit_cleanup(&self) {
        let store = self.store.clone();
        let retention_days = i64::from(self.options.audit_retention_days);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            // the first tick fires immediately; skip it so startup does
            // not race test fixtures
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
                match store.cleanup_audit_logs(cutoff).await {
                    Ok(removed) => debug!(removed, "audit cleanup pass finished"),
                    Err(err) => warn!("audit cleanup failed: {err}"),
                }
            }
        });
    }
}
