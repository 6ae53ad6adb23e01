//! Operations available on plain values during replay.

use std::cmp::Ordering;

use crate::error::ReplayError;
use crate::value::Value;

pub(crate) fn get(value: &Value, name: &str) -> Result<Value, ReplayError> {
    let found = match value {
        Value::Map(map) => map.get(name).cloned(),
        Value::List(items) if name == "length" => Some(Value::Int(items.len() as i64)),
        Value::List(items) => name
            .parse::<usize>()
            .ok()
            .and_then(|idx| items.get(idx).cloned()),
        Value::String(s) if name == "length" => Some(Value::Int(s.chars().count() as i64)),
        _ => None,
    };
    found.ok_or_else(|| ReplayError::PropertyMissing {
        type_tag: value.kind().to_string(),
        name: name.to_string(),
    })
}

pub(crate) fn call(value: &Value, name: &str, args: &[Value]) -> Result<Value, ReplayError> {
    match name {
        "==" | "eq" => Ok(Value::Bool(value == operand(name, args)?)),
        "!=" | "ne" => Ok(Value::Bool(value != operand(name, args)?)),
        ">" | "gt" => compare(value, name, args, |o| o == Ordering::Greater),
        ">=" | "gte" => compare(value, name, args, |o| o != Ordering::Less),
        "<" | "lt" => compare(value, name, args, |o| o == Ordering::Less),
        "<=" | "lte" => compare(value, name, args, |o| o != Ordering::Greater),
        "not" => Ok(Value::Bool(!truthy(value, name)?)),
        "and" => Ok(Value::Bool(
            truthy(value, name)? && truthy(operand(name, args)?, name)?,
        )),
        "or" => Ok(Value::Bool(
            truthy(value, name)? || truthy(operand(name, args)?, name)?,
        )),
        "+" | "add" => arithmetic(value, name, args, i64::checked_add, |a, b| a + b),
        "-" | "sub" => arithmetic(value, name, args, i64::checked_sub, |a, b| a - b),
        "*" | "mul" => arithmetic(value, name, args, i64::checked_mul, |a, b| a * b),
        _ => Err(ReplayError::MethodMissing {
            type_tag: value.kind().to_string(),
            name: name.to_string(),
        }),
    }
}

fn operand<'a>(name: &str, args: &'a [Value]) -> Result<&'a Value, ReplayError> {
    match args {
        [one] => Ok(one),
        _ => Err(ReplayError::mismatch(format!(
            "`{name}` expects one argument, got {}",
            args.len()
        ))),
    }
}

fn truthy(value: &Value, name: &str) -> Result<bool, ReplayError> {
    value.as_bool().ok_or_else(|| {
        ReplayError::mismatch(format!("`{name}` expects bool, found {}", value.kind()))
    })
}

fn compare(
    value: &Value,
    name: &str,
    args: &[Value],
    accept: impl Fn(Ordering) -> bool,
) -> Result<Value, ReplayError> {
    let other = operand(name, args)?;
    let ordering = value.compare(other).ok_or_else(|| {
        ReplayError::mismatch(format!(
            "cannot compare {} with {} using `{name}`",
            value.kind(),
            other.kind()
        ))
    })?;
    Ok(Value::Bool(accept(ordering)))
}

fn arithmetic(
    value: &Value,
    name: &str,
    args: &[Value],
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, ReplayError> {
    let other = operand(name, args)?;
    match (value, other) {
        (Value::Int(a), Value::Int(b)) => int_op(*a, *b)
            .map(Value::Int)
            .ok_or_else(|| ReplayError::Target(format!("integer overflow in `{name}`"))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(float_op(*a as f64, *b))),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(float_op(*a, *b as f64))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(*a, *b))),
        (Value::String(a), Value::String(b)) if name == "+" || name == "add" => {
            Ok(Value::String(format!("{a}{b}")))
        }
        _ => Err(ReplayError::mismatch(format!(
            "`{name}` is not defined for {} and {}",
            value.kind(),
            other.kind()
        ))),
    }
}
