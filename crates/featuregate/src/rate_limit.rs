//! Fixed-window per-path rate limiting.
//!
//! Budgets are per path class and per principal (session user when
//! known, client address otherwise). Saturated requests are rejected
//! before any storage work happens.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitSettings;
use crate::error::{ApiError, ErrorCode};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateClass {
    Evaluate,
    EvaluateBatch,
    Events,
    Admin,
}

pub struct RateLimiter {
    settings: RateLimitSettings,
    windows: Mutex<HashMap<(RateClass, String), (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn budget(&self, class: RateClass) -> u32 {
        match class {
            RateClass::Evaluate => self.settings.evaluate_per_minute,
            RateClass::EvaluateBatch => self.settings.evaluate_batch_per_minute,
            RateClass::Events => self.settings.events_per_minute,
            RateClass::Admin => self.settings.admin_per_minute,
        }
    }

    /// Consumes one unit of budget, rejecting with
    /// `RATE_LIMIT_EXCEEDED` when the window is exhausted.
    pub fn check(&self, class: RateClass, principal: &str) -> Result<(), ApiError> {
        if !self.settings.enabled {
            return Ok(());
        }
        let budget = self.budget(class);
        let now = Instant::now();
        let Ok(mut windows) = self.windows.lock() else {
            return Ok(());
        };
        // opportunistic cleanup keeps the map from growing with dead
        // principals
        if windows.len() > 4096 {
            windows.retain(|_, (start, _)| now.duration_since(*start) < WINDOW);
        }
        let entry = windows
            .entry((class, principal.to_string()))
            .or_insert((now, 0));
        if now.duration_since(entry.0) >= WINDOW {
            *entry = (now, 0);
        }
        if entry.1 >= budget {
            return Err(ApiError::new(
                ErrorCode::RateLimitExceeded,
                "rate limit exceeded",
            ));
        }
        entry.1 += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(admin: u32) -> RateLimitSettings {
        RateLimitSettings {
            enabled: true,
            evaluate_per_minute: 100,
            evaluate_batch_per_minute: 1000,
            events_per_minute: 600,
            admin_per_minute: admin,
        }
    }

    #[test]
    fn test_budget_exhaustion() {
        let limiter = RateLimiter::new(settings(2));
        assert!(limiter.check(RateClass::Admin, "u1").is_ok());
        assert!(limiter.check(RateClass::Admin, "u1").is_ok());
        let err = limiter.check(RateClass::Admin, "u1").unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimitExceeded);
    }

    #[test]
    fn test_principals_are_isolated() {
        let limiter = RateLimiter::new(settings(1));
        assert!(limiter.check(RateClass::Admin, "u1").is_ok());
        assert!(limiter.check(RateClass::Admin, "u2").is_ok());
        assert!(limiter.check(RateClass::Admin, "u1").is_err());
    }

    #[test]
    fn test_classes_are_isolated() {
        let limiter = RateLimiter::new(settings(1));
        assert!(limiter.check(RateClass::Admin, "u1").is_ok());
        assert!(limiter.check(RateClass::Evaluate, "u1").is_ok());
    }

    #[test]
    fn test_disabled_limiter_is_inert() {
        let mut s = settings(0);
        s.enabled = false;
        let limiter = RateLimiter::new(s);
        assert!(limiter.check(RateClass::Admin, "u1").is_ok());
    }
}
