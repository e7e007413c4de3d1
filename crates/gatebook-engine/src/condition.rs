//! Step skip-condition evaluation.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::StepError;
use crate::playbook::{Condition, Operator};
use crate::resolver::ParameterResolver;

/// Evaluates run-if conditions against the variable store.
pub struct ConditionEvaluator {
    resolver: ParameterResolver,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self {
            resolver: ParameterResolver::new(),
        }
    }

    /// Evaluate a condition; `false` means the step is skipped.
    ///
    /// Template resolution errors in the left side are surfaced as the
    /// owning step's failure.
    pub fn evaluate(
        &self,
        condition: &Condition,
        variables: &HashMap<String, Value>,
    ) -> Result<bool, StepError> {
        let left = self
            .resolver
            .substitute_variables(&condition.left, variables)?;
        let right = condition.right.clone().unwrap_or(Value::Null);

        let matched = match condition.op {
            Operator::Eq => values_equal(&left, &right),
            Operator::Ne => !values_equal(&left, &right),
            Operator::Gt => compare_numbers(&left, &right, |l, r| l > r),
            Operator::Lt => compare_numbers(&left, &right, |l, r| l < r),
            Operator::Gte => compare_numbers(&left, &right, |l, r| l >= r),
            Operator::Lte => compare_numbers(&left, &right, |l, r| l <= r),
            Operator::Contains => as_text(&left).contains(&as_text(&right)),
            Operator::Truthy => is_truthy(&left),
            Operator::Falsy => !is_truthy(&left),
        };

        Ok(matched)
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    // "5" == 5 after template stringification.
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l == r,
        _ => as_text(left) == as_text(right),
    }
}

fn compare_numbers(left: &Value, right: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => cmp(l, r),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
