use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::error::ModelError;
use crate::ident::{FlagId, RuleId};
use crate::value::FlagValue;

/// A targeting rule: a condition tree plus the value it yields, an
/// optional explicit variant, and an optional sticky percentage gate
/// applied inside the rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: RuleId,
    pub flag_id: FlagId,
    /// Lower priority evaluates first.
    pub priority: i64,
    pub conditions: Condition,
    pub value: FlagValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    pub fn validate(&self) -> Result<(), ModelError> {
        if let Some(p) = self.percentage {
            if !(0.0..=100.0).contains(&p) {
                return Err(ModelError::InvalidPercentage(p));
            }
        }
        Ok(())
    }
}

/// Sorts rules into their evaluation order: `priority` ascending, ties
/// broken by `created_at`, then lexicographically by id. Every storage
/// backend returns rules in this order; the engine re-applies it so the
/// ordering holds even for ad-hoc rule slices.
pub fn sort_rules(rules: &mut [Rule]) {
    rules.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rule(priority: i64, created_secs: i64) -> Rule {
        Rule {
            id: RuleId::new(),
            flag_id: FlagId::new(),
            priority,
            conditions: Condition::always(),
            value: FlagValue::Bool(true),
            variant: None,
            percentage: None,
            enabled: true,
            created_at: Utc.timestamp_opt(created_secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_sort_orders_by_priority_then_age() {
        let mut rules = vec![rule(2, 100), rule(1, 200), rule(1, 50)];
        sort_rules(&mut rules);
        assert_eq!(rules[0].priority, 1);
        assert_eq!(rules[0].created_at.timestamp(), 50);
        assert_eq!(rules[1].priority, 1);
        assert_eq!(rules[1].created_at.timestamp(), 200);
        assert_eq!(rules[2].priority, 2);
    }

    #[test]
    fn test_sort_breaks_full_ties_by_id() {
        let mut a = rule(1, 100);
        let mut b = rule(1, 100);
        if a.id.to_string() > b.id.to_string() {
            std::mem::swap(&mut a, &mut b);
        }
        let expected = a.id;
        let mut rules = vec![b, a];
        sort_rules(&mut rules);
        assert_eq!(rules[0].id, expected);
    }

    #[test]
    fn test_percentage_bounds() {
        let mut r = rule(1, 0);
        r.percentage = Some(150.0);
        assert!(matches!(r.validate(), Err(ModelError::InvalidPercentage(_))));
        r.percentage = Some(25.0);
        assert!(r.validate().is_ok());
    }
}
