//! Statistical properties of sticky assignment: rollout fractions and
//! variant splits converge to their configured percentages over a large
//! uniform population, and assignment is a pure function of
//! `(user, flag)`.

use chrono::Utc;
use featuregate_engine::{
    EvaluationContext, EvaluationOptions, EvaluationReason, Flag, FlagId, FlagType, FlagValue,
    Variant, evaluate_flag,
};
use proptest::prelude::*;

const POPULATION: usize = 100_000;
const TOLERANCE: f64 = 0.02;

fn flag(key: &str, rollout: f64, variants: Vec<Variant>) -> Flag {
    let now = Utc::now();
    Flag {
        id: FlagId::new(),
        key: key.to_string(),
        name: key.to_string(),
        description: None,
        flag_type: FlagType::String,
        enabled: true,
        default_value: FlagValue::String("off".to_string()),
        rollout_percentage: rollout,
        organization_id: None,
        variants,
        metadata: None,
        created_at: now,
        updated_at: now,
    }
}

fn variant(key: &str, weight: f64) -> Variant {
    Variant {
        key: key.to_string(),
        value: FlagValue::String(key.to_lowercase()),
        weight,
        metadata: None,
    }
}

#[test]
fn rollout_fraction_converges_to_percentage() {
    let f = flag("new-ui", 50.0, vec![variant("A", 50.0), variant("B", 50.0)]);
    let opts = EvaluationOptions::default();
    let now = Utc::now();

    let mut in_rollout = 0usize;
    let mut a = 0usize;
    let mut b = 0usize;
    for i in 0..POPULATION {
        let ctx = EvaluationContext::new().with_user_id(format!("user-{i}"));
        let result = evaluate_flag(&f, &[], None, &ctx, &opts, now);
        match result.reason {
            EvaluationReason::PercentageRollout => {
                in_rollout += 1;
                match result.variant.as_deref() {
                    Some("A") => a += 1,
                    Some("B") => b += 1,
                    other => panic!("unexpected variant {other:?}"),
                }
            }
            EvaluationReason::Default => {}
            other => panic!("unexpected reason {other:?}"),
        }
    }

    let fraction = in_rollout as f64 / POPULATION as f64;
    assert!(
        (fraction - 0.5).abs() < TOLERANCE,
        "rollout fraction {fraction} not within tolerance of 0.5"
    );
    // each variant takes half of the rolled-out half
    let a_fraction = a as f64 / POPULATION as f64;
    let b_fraction = b as f64 / POPULATION as f64;
    assert!((a_fraction - 0.25).abs() < TOLERANCE);
    assert!((b_fraction - 0.25).abs() < TOLERANCE);
}

#[test]
fn skewed_variant_weights_converge() {
    let f = flag(
        "checkout-copy",
        100.0,
        vec![variant("control", 80.0), variant("treatment", 20.0)],
    );
    let opts = EvaluationOptions::default();
    let now = Utc::now();

    let mut treatment = 0usize;
    for i in 0..POPULATION {
        let ctx = EvaluationContext::new().with_user_id(format!("user-{i}"));
        let result = evaluate_flag(&f, &[], None, &ctx, &opts, now);
        if result.variant.as_deref() == Some("treatment") {
            treatment += 1;
        }
    }
    let fraction = treatment as f64 / POPULATION as f64;
    assert!(
        (fraction - 0.2).abs() < TOLERANCE,
        "treatment fraction {fraction} not within tolerance of 0.2"
    );
}

proptest! {
    #[test]
    fn evaluation_is_deterministic(
        user in "[a-z0-9]{1,24}",
        key in "[a-z][a-z0-9-]{0,24}",
        rollout in 0.0f64..=100.0,
    ) {
        let f = flag(&key, rollout, vec![variant("A", 30.0), variant("B", 70.0)]);
        let ctx = EvaluationContext::new().with_user_id(&user);
        let opts = EvaluationOptions::default();
        let now = Utc::now();

        let first = evaluate_flag(&f, &[], None, &ctx, &opts, now);
        let second = evaluate_flag(&f, &[], None, &ctx, &opts, now);
        prop_assert_eq!(first.value, second.value);
        prop_assert_eq!(first.variant, second.variant);
        prop_assert_eq!(first.reason, second.reason);
    }

    #[test]
    fn zero_rollout_never_assigns(user in "[a-z0-9]{1,24}") {
        let f = flag("zeroed", 0.0, vec![variant("A", 100.0)]);
        let ctx = EvaluationContext::new().with_user_id(&user);
        let result = evaluate_flag(&f, &[], None, &ctx, &EvaluationOptions::default(), Utc::now());
        prop_assert_eq!(result.reason, EvaluationReason::Default);
    }

    #[test]
    fn rolled_out_variant_is_always_defined(user in "[a-z0-9]{1,24}") {
        let f = flag("split", 100.0, vec![variant("A", 50.0), variant("B", 50.0)]);
        let ctx = EvaluationContext::new().with_user_id(&user);
        let result = evaluate_flag(&f, &[], None, &ctx, &EvaluationOptions::default(), Utc::now());
        prop_assert_eq!(result.reason, EvaluationReason::PercentageRollout);
        prop_assert!(matches!(result.variant.as_deref(), Some("A") | Some("B")));
    }
}
