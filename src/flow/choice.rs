//! Choice rules.
//!
//! A rule is either a comparison leaf (`{"Variable": "$.x", "<Operator>": value}`)
//! or a boolean combinator (`And`, `Or`, `Not`). Top-level rules carry the
//! `Next` state taken when they match. Exactly one operator may appear per leaf.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Every comparison operator a leaf may use.
pub const OPERATORS: &[&str] = &[
    "BooleanEquals",
    "BooleanEqualsPath",
    "IsBoolean",
    "IsNull",
    "IsNumeric",
    "IsPresent",
    "IsString",
    "IsTimestamp",
    "NumericEquals",
    "NumericEqualsPath",
    "NumericGreaterThan",
    "NumericGreaterThanEquals",
    "NumericGreaterThanEqualsPath",
    "NumericGreaterThanPath",
    "NumericLessThan",
    "NumericLessThanEquals",
    "NumericLessThanEqualsPath",
    "NumericLessThanPath",
    "StringEquals",
    "StringEqualsPath",
    "StringGreaterThan",
    "StringGreaterThanEquals",
    "StringGreaterThanEqualsPath",
    "StringGreaterThanPath",
    "StringLessThan",
    "StringLessThanEquals",
    "StringLessThanEqualsPath",
    "StringLessThanPath",
    "StringMatches",
    "TimestampEquals",
    "TimestampEqualsPath",
    "TimestampGreaterThan",
    "TimestampGreaterThanEquals",
    "TimestampGreaterThanEqualsPath",
    "TimestampGreaterThanPath",
    "TimestampLessThan",
    "TimestampLessThanEquals",
    "TimestampLessThanEqualsPath",
    "TimestampLessThanPath",
];

/// A predicate over the run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Compare {
        variable: String,
        operator: String,
        value: Value,
    },
}

impl Condition {
    pub fn compare(variable: impl Into<String>, operator: impl Into<String>, value: Value) -> Self {
        Condition::Compare {
            variable: variable.into(),
            operator: operator.into(),
            value,
        }
    }

    /// Check operator names and value types.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Condition::And(items) | Condition::Or(items) => {
                if items.is_empty() {
                    return Err("And/Or rules need at least one condition".into());
                }
                items.iter().try_for_each(Condition::validate)
            }
            Condition::Not(inner) => inner.validate(),
            Condition::Compare {
                variable,
                operator,
                value,
            } => validate_leaf(variable, operator, value),
        }
    }

    /// Every JSON path this condition reads.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Condition::And(items) | Condition::Or(items) => {
                items.iter().flat_map(Condition::paths).collect()
            }
            Condition::Not(inner) => inner.paths(),
            Condition::Compare {
                variable,
                operator,
                value,
            } => {
                let mut paths = vec![variable.as_str()];
                if operator.ends_with("Path") {
                    if let Some(path) = value.as_str() {
                        paths.push(path);
                    }
                }
                paths
            }
        }
    }
}

fn validate_leaf(variable: &str, operator: &str, value: &Value) -> Result<(), String> {
    if !variable.starts_with("$.") {
        return Err(format!("Variable '{variable}' must be a JSON path starting with '$.'"));
    }
    if !OPERATORS.contains(&operator) {
        return Err(format!("unknown choice operator '{operator}'"));
    }

    if operator.ends_with("Path") {
        return match value.as_str() {
            Some(path) if path.starts_with("$.") => Ok(()),
            _ => Err(format!("{operator} needs a JSON path value starting with '$.'")),
        };
    }

    let ok = if operator.starts_with("Is") || operator.starts_with("Boolean") {
        value.is_boolean()
    } else if operator.starts_with("Numeric") {
        value.is_number()
    } else {
        value.is_string()
    };
    if ok {
        Ok(())
    } else {
        Err(format!("{operator} does not accept the value {value}"))
    }
}

impl TryFrom<Map<String, Value>> for Condition {
    type Error = String;

    fn try_from(mut map: Map<String, Value>) -> Result<Self, Self::Error> {
        for combinator in ["And", "Or"] {
            if let Some(items) = map.remove(combinator) {
                if !map.is_empty() {
                    return Err(format!("{combinator} rule has extra fields"));
                }
                let Value::Array(items) = items else {
                    return Err(format!("{combinator} must be a list of rules"));
                };
                let items = items
                    .into_iter()
                    .map(condition_from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(if combinator == "And" {
                    Condition::And(items)
                } else {
                    Condition::Or(items)
                });
            }
        }

        if let Some(inner) = map.remove("Not") {
            if !map.is_empty() {
                return Err("Not rule has extra fields".into());
            }
            return Ok(Condition::Not(Box::new(condition_from_value(inner)?)));
        }

        let variable = match map.remove("Variable") {
            Some(Value::String(v)) => v,
            Some(_) => return Err("Variable must be a string".into()),
            None => return Err("choice rule needs Variable, And, Or or Not".into()),
        };

        let mut operators = map.into_iter();
        let (operator, value) = match (operators.next(), operators.next()) {
            (Some(pair), None) => pair,
            (None, _) => return Err(format!("rule on '{variable}' has no operator")),
            (Some((first, _)), Some((second, _))) => {
                return Err(format!(
                    "rule on '{variable}' sets more than one operator ({first}, {second})"
                ))
            }
        };

        let condition = Condition::Compare {
            variable,
            operator,
            value,
        };
        condition.validate()?;
        Ok(condition)
    }
}

fn condition_from_value(value: Value) -> Result<Condition, String> {
    match value {
        Value::Object(map) => Condition::try_from(map),
        other => Err(format!("expected a rule object, found {other}")),
    }
}

impl From<Condition> for Map<String, Value> {
    fn from(condition: Condition) -> Self {
        let mut map = Map::new();
        match condition {
            Condition::And(items) => {
                map.insert("And".into(), Value::Array(items.into_iter().map(into_value).collect()));
            }
            Condition::Or(items) => {
                map.insert("Or".into(), Value::Array(items.into_iter().map(into_value).collect()));
            }
            Condition::Not(inner) => {
                map.insert("Not".into(), into_value(*inner));
            }
            Condition::Compare {
                variable,
                operator,
                value,
            } => {
                map.insert("Variable".into(), Value::String(variable));
                map.insert(operator, value);
            }
        }
        map
    }
}

fn into_value(condition: Condition) -> Value {
    Value::Object(condition.into())
}

/// A top-level rule of a `Choice` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct ChoiceRule {
    pub condition: Condition,
    pub next: String,
}

impl ChoiceRule {
    pub fn new(condition: Condition, next: impl Into<String>) -> Self {
        Self {
            condition,
            next: next.into(),
        }
    }
}

impl TryFrom<Map<String, Value>> for ChoiceRule {
    type Error = String;

    fn try_from(mut map: Map<String, Value>) -> Result<Self, Self::Error> {
        let next = match map.remove("Next") {
            Some(Value::String(next)) => next,
            Some(_) => return Err("choice rule Next must be a string".into()),
            None => return Err("choice rule is missing Next".into()),
        };
        let condition = Condition::try_from(map)?;
        condition.validate()?;
        Ok(Self { condition, next })
    }
}

impl From<ChoiceRule> for Map<String, Value> {
    fn from(rule: ChoiceRule) -> Self {
        let mut map: Map<String, Value> = rule.condition.into();
        map.insert("Next".into(), Value::String(rule.next));
        map
    }
}
