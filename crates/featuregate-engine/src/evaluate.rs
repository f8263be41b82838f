//! Flag evaluation.
//!
//! The engine is a pure function over a flag snapshot: given the flag,
//! its rules, the caller's override (if any), and the evaluation
//! context, it resolves a value and the reason it was chosen. The total
//! order is: override → disabled → rules → rollout gate → variant
//! selection → default. Override-before-disabled is deliberate - a
//! support override can force a value while the flag is globally off -
//! and [`DisabledPrecedence`] preserves the opposite ordering for
//! deployments that need it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::EvaluationContext;
use crate::flag::Flag;
use crate::ident::assignment_bucket;
use crate::overrides::Override;
use crate::rule::{Rule, sort_rules};
use crate::value::FlagValue;

/// Enumerated cause of a chosen value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationReason {
    RuleMatch,
    Override,
    PercentageRollout,
    Default,
    Disabled,
    NotFound,
}

impl std::fmt::Display for EvaluationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvaluationReason::RuleMatch => "rule_match",
            EvaluationReason::Override => "override",
            EvaluationReason::PercentageRollout => "percentage_rollout",
            EvaluationReason::Default => "default",
            EvaluationReason::Disabled => "disabled",
            EvaluationReason::NotFound => "not_found",
        };
        write!(f, "{s}")
    }
}

/// Whether a live override outranks a disabled flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledPrecedence {
    /// An override applies even when the flag is disabled (default).
    #[default]
    OverrideWins,
    /// A disabled flag returns its default before overrides are read.
    DisabledWins,
}

/// Per-evaluation options.
#[derive(Debug, Clone, Default)]
pub struct EvaluationOptions {
    /// Attach assignment internals to the result metadata.
    pub debug: bool,
    pub environment: Option<String>,
    pub disabled_precedence: DisabledPrecedence,
}

/// The outcome of evaluating one flag for one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub value: FlagValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub reason: EvaluationReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Evaluation {
    /// Result for a flag that does not exist: the caller-supplied
    /// default (JSON null when none was given).
    pub fn not_found(caller_default: Option<FlagValue>) -> Self {
        Evaluation {
            value: caller_default.unwrap_or(FlagValue::Json(Value::Null)),
            variant: None,
            reason: EvaluationReason::NotFound,
            metadata: None,
        }
    }
}

/// Evaluates `flag` for `ctx`.
///
/// `rules` may arrive in any order; the engine applies the canonical
/// `(priority, created_at, id)` order itself. `user_override` is the
/// stored override for `(flag, ctx.user_id)`, already looked up by the
/// caller; expiry is checked here against `now`.
pub fn evaluate_flag(
    flag: &Flag,
    rules: &[Rule],
    user_override: Option<&Override>,
    ctx: &EvaluationContext,
    opts: &EvaluationOptions,
    now: DateTime<Utc>,
) -> Evaluation {
    let sticky = ctx.sticky_key();
    let bucket = sticky.map(|key| assignment_bucket(key, &flag.key));
    let mut trace = Trace {
        flag,
        opts,
        sticky,
        bucket,
        rule_ids_evaluated: Vec::new(),
    };

    let active_override = user_override.filter(|o| ctx.user_id.is_some() && !o.is_expired(now));

    match opts.disabled_precedence {
        DisabledPrecedence::OverrideWins => {
            if let Some(o) = active_override {
                return trace.finish(
                    o.value.clone(),
                    o.variant.clone(),
                    EvaluationReason::Override,
                    None,
                );
            }
            if !flag.enabled {
                return trace.finish(
                    flag.default_value.clone(),
                    None,
                    EvaluationReason::Disabled,
                    None,
                );
            }
        }
        DisabledPrecedence::DisabledWins => {
            if !flag.enabled {
                return trace.finish(
                    flag.default_value.clone(),
                    None,
                    EvaluationReason::Disabled,
                    None,
                );
            }
            if let Some(o) = active_override {
                return trace.finish(
                    o.value.clone(),
                    o.variant.clone(),
                    EvaluationReason::Override,
                    None,
                );
            }
        }
    }

    let document = ctx.to_document();
    let mut ordered: Vec<Rule> = rules.to_vec();
    sort_rules(&mut ordered);

    for rule in ordered.iter().filter(|r| r.enabled) {
        trace.rule_ids_evaluated.push(rule.id.to_string());
        if !rule.conditions.matches(&document) {
            continue;
        }
        // The percentage gate only applies when assignment can be
        // sticky; without a principal the gate is a no-op.
        if let (Some(percentage), Some(b)) = (rule.percentage, bucket) {
            if f64::from(b) >= percentage * 100.0 {
                continue;
            }
        }
        let (value, variant) = match rule.variant.as_deref().and_then(|key| flag.variant(key)) {
            Some(v) => (v.value.clone(), Some(v.key.clone())),
            // A variant key not defined on the flag falls back to the
            // rule's own value.
            None => (rule.value.clone(), None),
        };
        return trace.finish(value, variant, EvaluationReason::RuleMatch, Some(rule.id.to_string()));
    }

    if flag.rollout_percentage < 100.0 {
        match bucket {
            // Non-sticky assignment never enters a partial rollout.
            None => {
                return trace.finish(
                    flag.default_value.clone(),
                    None,
                    EvaluationReason::Default,
                    None,
                );
            }
            Some(b) if f64::from(b) >= flag.rollout_percentage * 100.0 => {
                return trace.finish(
                    flag.default_value.clone(),
                    None,
                    EvaluationReason::Default,
                    None,
                );
            }
            Some(_) => {}
        }
    }

    if !flag.variants.is_empty() {
        if let Some(b) = bucket {
            let variant_bucket = f64::from(b) / 100.0;
            let mut cumulative = 0.0;
            for variant in &flag.variants {
                cumulative += variant.weight;
                if variant_bucket < cumulative {
                    return trace.finish(
                        variant.value.clone(),
                        Some(variant.key.clone()),
                        EvaluationReason::PercentageRollout,
                        None,
                    );
                }
            }
        }
        // No sticky key: variant assignment would not be reproducible,
        // so the principal gets the default.
    }

    trace.finish(
        flag.default_value.clone(),
        None,
        EvaluationReason::Default,
        None,
    )
}

struct Trace<'a> {
    flag: &'a Flag,
    opts: &'a EvaluationOptions,
    sticky: Option<&'a str>,
    bucket: Option<u32>,
    rule_ids_evaluated: Vec<String>,
}

impl Trace<'_> {
    fn finish(
        self,
        value: FlagValue,
        variant: Option<String>,
        reason: EvaluationReason,
        rule_id: Option<String>,
    ) -> Evaluation {
        let mut metadata = Map::new();
        if let Some(rule_id) = rule_id {
            metadata.insert("ruleId".to_string(), Value::String(rule_id));
        }
        if self.opts.debug {
            metadata.insert(
                "ruleIdsEvaluated".to_string(),
                Value::Array(
                    self.rule_ids_evaluated
                        .into_iter()
                        .map(Value::String)
                        .collect(),
                ),
            );
            if let Some(env) = &self.opts.environment {
                metadata.insert("environment".to_string(), Value::String(env.clone()));
            }
            if let Some(bucket) = self.bucket {
                metadata.insert("rolloutBucket".to_string(), Value::Number(bucket.into()));
                if let Some(n) = serde_json::Number::from_f64(f64::from(bucket) / 100.0) {
                    metadata.insert("variantBucket".to_string(), Value::Number(n));
                }
            }
            if let Some(sticky) = self.sticky {
                metadata.insert(
                    "hashInput".to_string(),
                    Value::String(format!("{sticky}:{}", self.flag.key)),
                );
            }
        }
        Evaluation {
            value,
            variant,
            reason,
            metadata: (!metadata.is_empty()).then_some(metadata),
        }
    }
}
