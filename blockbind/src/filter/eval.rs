//! Evaluate filter expressions against JSON records.
//!
//! Used by the in-memory resource client. Dotted paths walk nested objects;
//! a path that crosses an array (a to-many association) collects the values
//! of every element and the condition holds if any of them satisfies it.

use super::{is_blank, Condition, FilterExpression, Operator};
use serde_json::Value;
use std::cmp::Ordering;

impl FilterExpression {
    pub fn matches(&self, record: &Value) -> bool {
        match self {
            FilterExpression::And(items) => items.iter().all(|i| i.matches(record)),
            FilterExpression::Or(items) => {
                items.is_empty() || items.iter().any(|i| i.matches(record))
            }
            FilterExpression::Condition(c) => c.matches(record),
        }
    }
}

impl Condition {
    pub fn matches(&self, record: &Value) -> bool {
        let candidates = resolve_path(record, &self.field);
        match &self.operator {
            Operator::Eq => candidates.iter().any(|a| loose_eq(a, &self.value)),
            Operator::Ne => !candidates.iter().any(|a| loose_eq(a, &self.value)),
            Operator::In => candidates.iter().any(|a| in_set(a, &self.value)),
            Operator::NotIn => !candidates.iter().any(|a| in_set(a, &self.value)),
            Operator::Gt => any_cmp(&candidates, &self.value, |o| o == Ordering::Greater),
            Operator::Gte => any_cmp(&candidates, &self.value, |o| o != Ordering::Less),
            Operator::Lt => any_cmp(&candidates, &self.value, |o| o == Ordering::Less),
            Operator::Lte => any_cmp(&candidates, &self.value, |o| o != Ordering::Greater),
            Operator::Includes => candidates.iter().any(|a| includes(a, &self.value)),
            Operator::NotIncludes => !candidates.iter().any(|a| includes(a, &self.value)),
            Operator::Empty => candidates.iter().all(is_blank),
            Operator::NotEmpty => candidates.iter().any(|a| !is_blank(a)),
            Operator::Other(op) => {
                log::warn!("[filter] operator {} is not evaluated in memory", op);
                false
            }
        }
    }
}

/// Values at `path`, flattening arrays met along the way. A missing path
/// yields a single null.
pub fn resolve_path(record: &Value, path: &str) -> Vec<Value> {
    let mut current = vec![record.clone()];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Array(items) => {
                    for item in items {
                        next.push(item.get(segment).cloned().unwrap_or(Value::Null));
                    }
                }
                other => next.push(other.get(segment).cloned().unwrap_or(Value::Null)),
            }
        }
        current = next;
    }
    // the leaf itself may be an array field
    current
        .into_iter()
        .flat_map(|v| match v {
            Value::Array(items) if !items.is_empty() => items,
            other => vec![other],
        })
        .collect()
}

/// Numbers compare numerically; a number and a numeric string compare by
/// text, since row keys often arrive as strings.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            n.to_string() == *s
        }
        _ => a == b,
    }
}

fn in_set(actual: &Value, set: &Value) -> bool {
    match set {
        Value::Array(items) => items.iter().any(|e| loose_eq(actual, e)),
        single => loose_eq(actual, single),
    }
}

pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn any_cmp(candidates: &[Value], expected: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    candidates
        .iter()
        .filter_map(|a| compare(a, expected))
        .any(accept)
}

fn includes(actual: &Value, needle: &Value) -> bool {
    match (actual, needle) {
        (Value::String(hay), Value::String(n)) => hay.to_lowercase().contains(&n.to_lowercase()),
        (Value::String(hay), Value::Array(ns)) => ns.iter().any(|n| includes(&Value::String(hay.clone()), n)),
        _ => false,
    }
}
