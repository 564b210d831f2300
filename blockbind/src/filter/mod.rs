//! Filter expressions exchanged between blocks and sent to the resource API.
//!
//! Wire shape (kept exactly):
//!
//! ```text
//! { "$and": [ <expr>, ... ] }            group
//! { "$or":  [ <expr>, ... ] }            group
//! { "<field>": { "<operator>": value } } condition (field may be dotted)
//! ```
//!
//! A condition whose value is null, an empty array, an empty string or an
//! empty object carries no constraint and is pruned before merging. A group
//! that loses all its members is pruned with them. An empty `$in` is pruned
//! too: a cleared multi-select means "no filter", not "match nothing".

pub mod eval;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FilterParseError {
    #[error("Expected an object, found: {0}")]
    NotAnObject(String),
    #[error("`{0}` expects an array of expressions")]
    GroupNotArray(String),
    #[error("Unknown logical operator: {0}")]
    UnknownLogical(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    In,
    NotIn,
    Gt,
    Gte,
    Lt,
    Lte,
    Includes,
    NotIncludes,
    Empty,
    NotEmpty,
    /// Any operator the engine passes through without interpreting.
    Other(String),
}

impl Operator {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "$eq" => Operator::Eq,
            "$ne" => Operator::Ne,
            "$in" => Operator::In,
            "$notIn" => Operator::NotIn,
            "$gt" => Operator::Gt,
            "$gte" => Operator::Gte,
            "$lt" => Operator::Lt,
            "$lte" => Operator::Lte,
            "$includes" => Operator::Includes,
            "$notIncludes" => Operator::NotIncludes,
            "$empty" => Operator::Empty,
            "$notEmpty" => Operator::NotEmpty,
            other => Operator::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Operator::Eq => "$eq",
            Operator::Ne => "$ne",
            Operator::In => "$in",
            Operator::NotIn => "$notIn",
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
            Operator::Includes => "$includes",
            Operator::NotIncludes => "$notIncludes",
            Operator::Empty => "$empty",
            Operator::NotEmpty => "$notEmpty",
            Operator::Other(raw) => raw,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{field: {operator: value}}`
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Condition {
    pub fn is_removable(&self) -> bool {
        is_blank(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpression {
    And(Vec<FilterExpression>),
    Or(Vec<FilterExpression>),
    Condition(Condition),
}

impl FilterExpression {
    pub fn condition(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        FilterExpression::Condition(Condition {
            field: field.into(),
            operator,
            value,
        })
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::condition(field, Operator::Eq, value)
    }

    pub fn in_values(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::condition(field, Operator::In, Value::Array(values))
    }

    pub fn and(items: Vec<FilterExpression>) -> Self {
        FilterExpression::And(items)
    }

    pub fn or(items: Vec<FilterExpression>) -> Self {
        FilterExpression::Or(items)
    }

    /// True when the expression constrains nothing.
    pub fn is_removable(&self) -> bool {
        match self {
            FilterExpression::Condition(c) => c.is_removable(),
            FilterExpression::And(items) | FilterExpression::Or(items) => {
                items.iter().all(|i| i.is_removable())
            }
        }
    }

    /// Drop removable conditions and the groups they leave empty.
    pub fn prune(self) -> Option<FilterExpression> {
        match self {
            FilterExpression::Condition(c) => {
                if c.is_removable() {
                    None
                } else {
                    Some(FilterExpression::Condition(c))
                }
            }
            FilterExpression::And(items) => {
                let kept: Vec<_> = items.into_iter().filter_map(|i| i.prune()).collect();
                (!kept.is_empty()).then_some(FilterExpression::And(kept))
            }
            FilterExpression::Or(items) => {
                let kept: Vec<_> = items.into_iter().filter_map(|i| i.prune()).collect();
                (!kept.is_empty()).then_some(FilterExpression::Or(kept))
            }
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            FilterExpression::And(items) => group_value("$and", items),
            FilterExpression::Or(items) => group_value("$or", items),
            FilterExpression::Condition(c) => {
                let mut op = Map::new();
                op.insert(c.operator.as_str().to_string(), c.value.clone());
                let mut field = Map::new();
                field.insert(c.field.clone(), Value::Object(op));
                Value::Object(field)
            }
        }
    }

    /// Parse the JSON wire shape. `null` and `{}` parse to an empty `$and`,
    /// which prunes away.
    pub fn from_value(value: &Value) -> Result<Self, FilterParseError> {
        let map = match value {
            Value::Null => return Ok(FilterExpression::And(Vec::new())),
            Value::Object(map) => map,
            other => return Err(FilterParseError::NotAnObject(other.to_string())),
        };

        let mut items = Vec::new();
        for (key, inner) in map {
            match key.as_str() {
                "$and" | "$or" => {
                    let Value::Array(members) = inner else {
                        return Err(FilterParseError::GroupNotArray(key.clone()));
                    };
                    let parsed = members
                        .iter()
                        .map(Self::from_value)
                        .collect::<Result<Vec<_>, _>>()?;
                    items.push(if key == "$and" {
                        FilterExpression::And(parsed)
                    } else {
                        FilterExpression::Or(parsed)
                    });
                }
                k if k.starts_with('$') => {
                    return Err(FilterParseError::UnknownLogical(k.to_string()));
                }
                field => parse_field(field, inner, &mut items),
            }
        }

        if items.len() == 1 {
            Ok(items.remove(0))
        } else {
            Ok(FilterExpression::And(items))
        }
    }
}

fn group_value(key: &str, items: &[FilterExpression]) -> Value {
    let mut map = Map::new();
    map.insert(
        key.to_string(),
        Value::Array(items.iter().map(|i| i.to_value()).collect()),
    );
    Value::Object(map)
}

fn parse_field(path: &str, value: &Value, out: &mut Vec<FilterExpression>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, inner) in map {
                if key.starts_with('$') {
                    out.push(FilterExpression::condition(
                        path,
                        Operator::parse(key),
                        inner.clone(),
                    ));
                } else {
                    parse_field(&format!("{}.{}", path, key), inner, out);
                }
            }
        }
        // shorthand `{field: value}` means equality
        other => out.push(FilterExpression::eq(path, other.clone())),
    }
}

/// Null, `[]`, `""` and `{}` carry no constraint.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// `$and` over the pruned inputs, in input order. `None` when nothing
/// survives, meaning the request carries no filter at all.
pub fn merge_filters<I>(filters: I) -> Option<FilterExpression>
where
    I: IntoIterator<Item = Option<FilterExpression>>,
{
    let kept: Vec<_> = filters
        .into_iter()
        .flatten()
        .filter_map(|f| f.prune())
        .collect();
    (!kept.is_empty()).then_some(FilterExpression::And(kept))
}

/// `merge_filters` over raw JSON inputs.
pub fn merge_filter_values(values: &[Value]) -> Result<Option<FilterExpression>, FilterParseError> {
    let parsed = values
        .iter()
        .map(|v| FilterExpression::from_value(v).map(Some))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(merge_filters(parsed))
}

impl Serialize for FilterExpression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FilterExpression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        FilterExpression::from_value(&value).map_err(serde::de::Error::custom)
    }
}
