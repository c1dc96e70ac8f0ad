//! `MATH_EVAL`: a small unit-aware arithmetic evaluator for resolving
//! numeric placeholders during refinement (spec §4.6 step 1, §4.7).
//!
//! Supports `+ - * /` over quantities tagged with a unit (`"12 km"`,
//! `"3.5"`). Mixing incompatible units is a `UnitMismatch` error rather than
//! a silent coercion.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::Tool;
use crate::types::error::ToolError;

#[derive(Debug, Clone, PartialEq)]
struct Quantity {
    value: f64,
    unit: Option<String>,
}

fn parse_quantity(token: &str) -> Result<Quantity, ToolError> {
    let token = token.trim();
    let split_at = token
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-' && c != '+')
        .unwrap_or(token.len());
    let (num_part, unit_part) = token.split_at(split_at);
    let value: f64 = num_part
        .trim()
        .parse()
        .map_err(|_| ToolError::ParseError(format!("not a number: {token:?}")))?;
    let unit = unit_part.trim();
    Ok(Quantity {
        value,
        unit: if unit.is_empty() { None } else { Some(unit.to_string()) },
    })
}

fn require_same_unit(a: &Quantity, b: &Quantity) -> Result<Option<String>, ToolError> {
    match (&a.unit, &b.unit) {
        (None, None) => Ok(None),
        (Some(u), None) | (None, Some(u)) => Ok(Some(u.clone())),
        (Some(u1), Some(u2)) if u1 == u2 => Ok(Some(u1.clone())),
        (Some(u1), Some(u2)) => Err(ToolError::UnitMismatch {
            expected: u1.clone(),
            actual: u2.clone(),
        }),
    }
}

/// Evaluate a whitespace-tokenized `"<lhs> <op> <rhs>"` where `op` is one of
/// `+ - * /`. A single token is parsed as a bare quantity.
fn eval_expr(expr: &str) -> Result<Quantity, ToolError> {
    let tokens: Vec<&str> = expr.split_whitespace().collect();
    if tokens.len() == 1 {
        return parse_quantity(tokens[0]);
    }
    if tokens.len() != 3 {
        return Err(ToolError::ParseError(format!(
            "expected '<lhs> <op> <rhs>', got {expr:?}"
        )));
    }
    let lhs = parse_quantity(tokens[0])?;
    let rhs = parse_quantity(tokens[2])?;
    match tokens[1] {
        "+" => {
            let unit = require_same_unit(&lhs, &rhs)?;
            Ok(Quantity { value: lhs.value + rhs.value, unit })
        }
        "-" => {
            let unit = require_same_unit(&lhs, &rhs)?;
            Ok(Quantity { value: lhs.value - rhs.value, unit })
        }
        "*" => {
            if lhs.unit.is_some() && rhs.unit.is_some() {
                return Err(ToolError::UnitMismatch {
                    expected: "scalar".into(),
                    actual: format!("{} and {}", lhs.unit.unwrap(), rhs.unit.unwrap()),
                });
            }
            let unit = lhs.unit.clone().or(rhs.unit.clone());
            Ok(Quantity { value: lhs.value * rhs.value, unit })
        }
        "/" => {
            if rhs.value == 0.0 {
                return Err(ToolError::DomainError("division by zero".into()));
            }
            let unit = if lhs.unit == rhs.unit { None } else { lhs.unit.clone() };
            Ok(Quantity { value: lhs.value / rhs.value, unit })
        }
        other => Err(ToolError::ParseError(format!("unknown operator {other:?}"))),
    }
}

#[derive(Default)]
pub struct MathEvalTool;

#[async_trait]
impl Tool for MathEvalTool {
    fn name(&self) -> &'static str {
        "MATH_EVAL"
    }

    async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let expr = args
            .get("expr")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::ParseError("missing 'expr' argument".into()))?;
        let result = eval_expr(expr)?;
        Ok(json!({ "value": result.value, "unit": result.unit }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_plain_numbers() {
        let q = eval_expr("2 + 3").unwrap();
        assert_eq!(q.value, 5.0);
        assert_eq!(q.unit, None);
    }

    #[test]
    fn adds_matching_units() {
        let q = eval_expr("12km + 3km").unwrap();
        assert_eq!(q.value, 15.0);
        assert_eq!(q.unit.as_deref(), Some("km"));
    }

    #[test]
    fn rejects_mismatched_units() {
        let err = eval_expr("12km + 3mi").unwrap_err();
        assert!(matches!(err, ToolError::UnitMismatch { .. }));
    }

    #[test]
    fn rejects_division_by_zero() {
        let err = eval_expr("5 / 0").unwrap_err();
        assert!(matches!(err, ToolError::DomainError(_)));
    }

    #[tokio::test]
    async fn tool_invoke_roundtrips_through_json() {
        let tool = MathEvalTool;
        let out = tool.invoke(&json!({ "expr": "10 - 4" })).await.unwrap();
        assert_eq!(out["value"], 6.0);
    }
}
