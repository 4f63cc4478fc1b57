//! Comparison operators shared by the if, filter and switch nodes.
//!
//! Operands arrive already resolved (expressions are evaluated by the engine
//! before the node sees its parameters), so this module only compares values.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// One `left <operator> right` comparison.
#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub left: Value,
    #[serde(default = "default_operator")]
    pub operator: String,
    #[serde(default)]
    pub right: Value,
}

fn default_operator() -> String {
    "equals".to_string()
}

/// How several conditions combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combine {
    #[default]
    All,
    Any,
}

/// Evaluate a list of conditions.
pub fn evaluate_all(conditions: &[Condition], combine: Combine) -> Result<bool> {
    let mut results = Vec::with_capacity(conditions.len());
    for condition in conditions {
        results.push(evaluate(&condition.left, &condition.operator, &condition.right)?);
    }

    Ok(match combine {
        Combine::All => results.iter().all(|r| *r),
        Combine::Any => results.iter().any(|r| *r),
    })
}

/// Evaluate a single comparison.
pub fn evaluate(left: &Value, operator: &str, right: &Value) -> Result<bool> {
    match operator {
        "equals" => Ok(loose_eq(left, right)),
        "not_equals" => Ok(!loose_eq(left, right)),
        "contains" => match left {
            Value::String(s) => Ok(right
                .as_str()
                .map(|needle| s.contains(needle))
                .unwrap_or(false)),
            Value::Array(items) => Ok(items.contains(right)),
            Value::Object(map) => Ok(right.as_str().map(|k| map.contains_key(k)).unwrap_or(false)),
            _ => Ok(false),
        },
        "not_contains" => evaluate(left, "contains", right).map(|r| !r),
        "gt" | "lt" | "gte" | "lte" => {
            let l = as_f64(left).ok_or_else(|| {
                Error::Node(format!(
                    "Operator '{}' requires numeric left operand",
                    operator
                ))
            })?;
            let r = as_f64(right).ok_or_else(|| {
                Error::Node(format!(
                    "Operator '{}' requires numeric right operand",
                    operator
                ))
            })?;
            Ok(match operator {
                "gt" => l > r,
                "lt" => l < r,
                "gte" => l >= r,
                _ => l <= r,
            })
        }
        "is_empty" => Ok(is_empty(left)),
        "is_not_empty" => Ok(!is_empty(left)),
        "is_true" => Ok(left.as_bool() == Some(true) || left.as_str() == Some("true")),
        "is_false" => Ok(left.as_bool() == Some(false) || left.as_str() == Some("false")),
        "regex" => {
            let pattern = right
                .as_str()
                .ok_or_else(|| Error::Node("regex operator requires string pattern".to_string()))?;
            let text = stringify_value(left);
            let regex = regex_lite::Regex::new(pattern)
                .map_err(|e| Error::Node(format!("Invalid regex '{}': {}", pattern, e)))?;
            Ok(regex.is_match(&text))
        }
        _ => Err(Error::Node(format!("Unsupported operator '{}'", operator))),
    }
}

/// Equality that tolerates numbers rendered as strings by interpolation.
fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left, right) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            matches!((as_f64(left), as_f64(right)), (Some(l), Some(r)) if l == r)
        }
        _ => false,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        _ => value.to_string(),
    }
}
