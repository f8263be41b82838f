use murmurhash3::murmurhash3_x86_32;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of assignment buckets. Percentages are compared against
/// `bucket < percentage * 100`, which gives two decimal places of
/// rollout resolution.
pub const ASSIGNMENT_BUCKETS: u32 = 10_000;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

opaque_id!(
    /// Unique identifier for a flag.
    FlagId
);
opaque_id!(
    /// Unique identifier for a targeting rule.
    RuleId
);
opaque_id!(
    /// Unique identifier for a per-user override.
    OverrideId
);
opaque_id!(
    /// Unique identifier for an audit entry.
    AuditId
);
opaque_id!(
    /// Unique identifier for a recorded evaluation.
    EvaluationId
);
opaque_id!(
    /// Unique identifier for a tracked analytics event.
    EventId
);
opaque_id!(
    /// Unique identifier for an environment.
    EnvironmentId
);

/// Stable 32-bit assignment hash over `sticky_key + ":" + flag_key`.
///
/// Percentage rollouts and variant selection both derive from this value,
/// so the same principal lands in the same bucket across restarts. The
/// hash function and seed are frozen: changing either re-shuffles every
/// live rollout.
pub fn assignment_hash(sticky_key: &str, flag_key: &str) -> u32 {
    let input = format!("{sticky_key}:{flag_key}");
    murmurhash3_x86_32(input.as_bytes(), 0)
}

/// Assignment bucket in `[0, 10000)` for a `(sticky_key, flag_key)` pair.
pub fn assignment_bucket(sticky_key: &str, flag_key: &str) -> u32 {
    assignment_hash(sticky_key, flag_key) % ASSIGNMENT_BUCKETS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_roundtrip() {
        let id = FlagId::new();
        let other = FlagId::new();
        assert_ne!(id, other);

        let parsed: FlagId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_assignment_bucket_is_sticky() {
        let a = assignment_bucket("user-1", "dark-mode");
        let b = assignment_bucket("user-1", "dark-mode");
        assert_eq!(a, b);
        assert!(a < ASSIGNMENT_BUCKETS);
    }

    #[test]
    fn test_assignment_bucket_varies_by_flag() {
        // Different flags must not share bucket assignments for the
        // same user, otherwise rollouts would be correlated.
        let buckets: std::collections::HashSet<u32> = (0..64)
            .map(|i| assignment_bucket("user-1", &format!("flag-{i}")))
            .collect();
        assert!(buckets.len() > 32);
    }

    #[test]
    fn test_assignment_hash_is_frozen() {
        // Pinned value: stickiness across releases depends on byte-exact
        // reproduction of murmur3_x86_32("u:f", seed 0).
        assert_eq!(
            assignment_hash("u", "f"),
            murmurhash3_x86_32(b"u:f", 0)
        );
    }
}
