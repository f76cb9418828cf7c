// Conditional branch rules over the workflow context

use std::sync::Arc;

use serde_json::Value;

type CustomPredicate = Arc<dyn Fn(Option<&Value>) -> bool + Send + Sync>;

/// Test applied to one context value
#[derive(Clone)]
pub enum Predicate {
    Equals(Value),
    NotEquals(Value),
    GreaterThan(f64),
    LessThan(f64),
    Exists,
    Missing,
    /// Present and not `false`, `null`, `0` or `""`
    Truthy,
    Custom(CustomPredicate),
}

impl Predicate {
    pub fn custom(f: impl Fn(Option<&Value>) -> bool + Send + Sync + 'static) -> Self {
        Predicate::Custom(Arc::new(f))
    }

    pub fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Predicate::Equals(expected) => value == Some(expected),
            Predicate::NotEquals(expected) => value != Some(expected),
            Predicate::GreaterThan(bound) => value.and_then(Value::as_f64).is_some_and(|v| v > *bound),
            Predicate::LessThan(bound) => value.and_then(Value::as_f64).is_some_and(|v| v < *bound),
            Predicate::Exists => value.is_some(),
            Predicate::Missing => value.is_none(),
            Predicate::Truthy => value.is_some_and(is_truthy),
            Predicate::Custom(f) => f(value),
        }
    }
}

impl std::fmt::Debug for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Equals(v) => f.debug_tuple("Equals").field(v).finish(),
            Predicate::NotEquals(v) => f.debug_tuple("NotEquals").field(v).finish(),
            Predicate::GreaterThan(v) => f.debug_tuple("GreaterThan").field(v).finish(),
            Predicate::LessThan(v) => f.debug_tuple("LessThan").field(v).finish(),
            Predicate::Exists => f.write_str("Exists"),
            Predicate::Missing => f.write_str("Missing"),
            Predicate::Truthy => f.write_str("Truthy"),
            Predicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// `(key, predicate, target)` rule; the first matching rule wins
#[derive(Debug, Clone)]
pub struct BranchRule {
    pub key: String,
    pub predicate: Predicate,
    pub target: String,
}

impl BranchRule {
    pub fn new(key: impl Into<String>, predicate: Predicate, target: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            predicate,
            target: target.into(),
        }
    }
}
