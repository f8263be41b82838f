//! Rule condition trees.
//!
//! A condition is either a leaf comparison against a context attribute
//! path or a composite combining children with `all`/`any`/`not`. The
//! evaluator is total: malformed operands, missing paths, and regex
//! compilation failures all evaluate to `false`, never to an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Upper bound on compiled regex size for the `regex` operator. Keeps
/// pathological patterns from ballooning compile time; matching itself
/// is linear in the input.
const REGEX_SIZE_LIMIT: usize = 1 << 16;

/// Comparison operators available to leaf conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Regex,
}

/// A leaf comparison: resolve `attribute` against the context document
/// and compare with `value` under `operator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafCondition {
    pub attribute: String,
    pub operator: Operator,
    pub value: Value,
}

/// A composite node. All present sub-fields must hold for the node to
/// match: `all` is AND over children (empty ⇒ true), `any` is OR over
/// children (empty ⇒ false), `not` negates its child. An empty composite
/// matches everything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompositeCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any: Option<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<Condition>>,
}

/// A condition tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Leaf(LeafCondition),
    Composite(CompositeCondition),
}

impl Condition {
    /// Matches everything. Rules created without conditions use this.
    pub fn always() -> Self {
        Condition::Composite(CompositeCondition::default())
    }

    /// Evaluates the tree against a context document produced by
    /// [`crate::context::EvaluationContext::to_document`].
    pub fn matches(&self, document: &Value) -> bool {
        match self {
            Condition::Leaf(leaf) => {
                let actual = resolve_path(document, &leaf.attribute);
                leaf.operator.evaluate(actual, &leaf.value)
            }
            Condition::Composite(node) => {
                let all_ok = node
                    .all
                    .as_ref()
                    .map(|children| children.iter().all(|c| c.matches(document)))
                    .unwrap_or(true);
                let any_ok = node
                    .any
                    .as_ref()
                    .map(|children| children.iter().any(|c| c.matches(document)))
                    .unwrap_or(true);
                let not_ok = node
                    .not
                    .as_ref()
                    .map(|child| !child.matches(document))
                    .unwrap_or(true);
                all_ok && any_ok && not_ok
            }
        }
    }
}

/// Resolves a dotted attribute path (`"user.role"`, `"attributes.plan"`)
/// against the context document. Missing segments yield `None`.
pub fn resolve_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

impl Operator {
    /// Applies the operator to an optional resolved value and the rule
    /// operand. Negated operators are exact negations of their positive
    /// counterparts, so a missing attribute satisfies `not_equals`,
    /// `not_contains`, and `not_in`. Only the four ordering operators
    /// coerce operands to numbers; everything else compares
    /// structurally.
    pub fn evaluate(self, actual: Option<&Value>, expected: &Value) -> bool {
        match self {
            Operator::Equals => actual.is_some_and(|a| a == expected),
            Operator::NotEquals => !Operator::Equals.evaluate(actual, expected),
            Operator::Contains => actual.is_some_and(|a| contains(a, expected)),
            Operator::NotContains => !Operator::Contains.evaluate(actual, expected),
            Operator::StartsWith => string_pair(actual, expected)
                .is_some_and(|(a, e)| a.starts_with(e)),
            Operator::EndsWith => string_pair(actual, expected)
                .is_some_and(|(a, e)| a.ends_with(e)),
            Operator::In => actual.is_some_and(|a| in_list(a, expected)),
            Operator::NotIn => !Operator::In.evaluate(actual, expected),
            Operator::GreaterThan => numeric_pair(actual, expected)
                .is_some_and(|(a, e)| a > e),
            Operator::LessThan => numeric_pair(actual, expected)
                .is_some_and(|(a, e)| a < e),
            Operator::GreaterThanOrEqual => numeric_pair(actual, expected)
                .is_some_and(|(a, e)| a >= e),
            Operator::LessThanOrEqual => numeric_pair(actual, expected)
                .is_some_and(|(a, e)| a <= e),
            Operator::Regex => regex_match(actual, expected),
        }
    }
}

/// `contains`: substring on strings, structural membership on arrays.
fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(s) => expected.as_str().is_some_and(|e| s.contains(e)),
        Value::Array(items) => items.iter().any(|item| item == expected),
        _ => false,
    }
}

/// `in`: the operand must be an array; membership is structural.
fn in_list(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Array(items) => items.iter().any(|item| actual == item),
        _ => false,
    }
}

fn string_pair<'a>(actual: Option<&'a Value>, expected: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((actual?.as_str()?, expected.as_str()?))
}

/// Coerces both sides to numbers; non-numeric inputs disable the
/// comparison entirely.
fn numeric_pair(actual: Option<&Value>, expected: &Value) -> Option<(f64, f64)> {
    Some((as_number(actual?)?, as_number(expected)?))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Compiles the operand as a pattern and tests the resolved string.
/// Compilation failure is a non-match, never an engine failure.
fn regex_match(actual: Option<&Value>, expected: &Value) -> bool {
    let (Some(subject), Some(pattern)) = (actual.and_then(Value::as_str), expected.as_str())
    else {
        return false;
    };
    match regex::RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
    {
        Ok(re) => re.is_match(subject),
        Err(err) => {
            debug!("regex condition failed to compile: {err}");
            false
        }
    }
}
