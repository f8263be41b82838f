//! Service configuration.
//!
//! Options follow constructor-over-environment precedence: every
//! setting can be supplied in code, and `Default` fills the rest from
//! `FEATUREGATE_*` environment variables.

use std::time::Duration;

use featuregate_engine::{AttributeLimits, DisabledPrecedence, HeaderRule};

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env_var(name).map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
}

/// Evaluation cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Maximum number of entries the cache can hold.
    /// Default: 1000
    pub max_size: usize,
    /// Time-to-live for cache entries.
    /// Default: 60 seconds
    pub ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: env_bool("FEATUREGATE_CACHE").unwrap_or(true),
            max_size: env_parse("FEATUREGATE_MAX_CACHE_SIZE").unwrap_or(1000),
            ttl: Duration::from_secs(env_parse("FEATUREGATE_CACHE_TTL").unwrap_or(60)),
        }
    }
}

/// Fixed-window request budgets per path class, per minute.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub evaluate_per_minute: u32,
    pub evaluate_batch_per_minute: u32,
    pub events_per_minute: u32,
    pub admin_per_minute: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: env_bool("FEATUREGATE_RATE_LIMIT").unwrap_or(true),
            evaluate_per_minute: env_parse("FEATUREGATE_RATE_LIMIT_EVALUATE").unwrap_or(100),
            evaluate_batch_per_minute: env_parse("FEATUREGATE_RATE_LIMIT_BATCH").unwrap_or(1000),
            events_per_minute: env_parse("FEATUREGATE_RATE_LIMIT_EVENTS").unwrap_or(600),
            admin_per_minute: env_parse("FEATUREGATE_RATE_LIMIT_ADMIN").unwrap_or(20),
        }
    }
}

/// Top-level service options.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Roles whose members may use the admin surface.
    /// Default: `["admin"]` (`FEATUREGATE_ADMIN_ROLES`, comma-separated)
    pub admin_roles: Vec<String>,
    /// Whether the admin surface is reachable at all.
    pub admin_enabled: bool,
    /// Enforce per-organization scoping of flags and admin access.
    pub multi_tenant: bool,
    /// Record evaluations (individual requests can still opt out with
    /// `track: false`).
    pub track_usage: bool,
    pub audit_enabled: bool,
    /// Audit entries older than this are removed by the daily cleanup.
    pub audit_retention_days: u32,
    /// Ordering of override vs. disabled, see the engine docs.
    pub disabled_precedence: DisabledPrecedence,
    pub cache: CacheSettings,
    pub rate_limits: RateLimitSettings,
    pub attribute_limits: AttributeLimits,
    /// Whitelist of headers folded into context attributes.
    pub header_rules: Vec<HeaderRule>,
    /// Capacity of the recorder queue; overflow drops the newest event.
    pub recorder_capacity: usize,
    /// Time-to-live of event idempotency keys.
    pub idempotency_ttl: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        let admin_roles = env_var("FEATUREGATE_ADMIN_ROLES")
            .map(|csv| {
                csv.split(',')
                    .map(|role| role.trim().to_string())
                    .filter(|role| !role.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| vec!["admin".to_string()]);
        Self {
            admin_roles,
            admin_enabled: env_bool("FEATUREGATE_ADMIN").unwrap_or(true),
            multi_tenant: env_bool("FEATUREGATE_MULTI_TENANT").unwrap_or(false),
            track_usage: env_bool("FEATUREGATE_TRACK_USAGE").unwrap_or(true),
            audit_enabled: env_bool("FEATUREGATE_AUDIT").unwrap_or(true),
            audit_retention_days: env_parse("FEATUREGATE_AUDIT_RETENTION_DAYS").unwrap_or(90),
            disabled_precedence: DisabledPrecedence::default(),
            cache: CacheSettings::default(),
            rate_limits: RateLimitSettings::default(),
            attribute_limits: AttributeLimits::default(),
            header_rules: default_header_rules(),
            recorder_capacity: env_parse("FEATUREGATE_RECORDER_CAPACITY").unwrap_or(1024),
            idempotency_ttl: Duration::from_secs(
                env_parse("FEATUREGATE_IDEMPOTENCY_TTL").unwrap_or(24 * 60 * 60),
            ),
        }
    }
}

/// The out-of-the-box header whitelist: deployment ring plus common
/// client hints.
pub fn default_header_rules() -> Vec<HeaderRule> {
    vec![
        HeaderRule::enumerated("x-deployment-ring", &["canary", "preview", "production"]),
        HeaderRule::string("x-device-type"),
        HeaderRule::string("x-app-version"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ServiceOptions::default();
        assert_eq!(options.admin_roles, vec!["admin".to_string()]);
        assert!(options.track_usage);
        assert_eq!(options.audit_retention_days, 90);
        assert_eq!(options.cache.max_size, 1000);
        assert_eq!(options.rate_limits.admin_per_minute, 20);
    }
}
