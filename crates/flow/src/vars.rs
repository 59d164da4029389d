//! `${name}` substitution over a task's variable environment.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use rpa_core_types::Variables;
use serde_json::Value;

static REFERENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}").unwrap());

/// Resolves a dotted path such as `row.email` or `items.0`.
pub fn lookup<'a>(variables: &'a Variables, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = variables.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Text form of a value as it appears inside a substituted string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replaces every known `${path}` reference. Unknown references stay verbatim.
pub fn substitute(template: &str, variables: &Variables) -> String {
    if !template.contains("${") {
        return template.to_string();
    }
    REFERENCE_RE
        .replace_all(template, |caps: &Captures<'_>| match lookup(variables, &caps[1]) {
            Some(value) => value_to_string(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Substitutes recursively inside a JSON value. A string that is exactly one
/// known reference keeps the referenced value's type.
pub fn render_value(value: &Value, variables: &Variables) -> Value {
    match value {
        Value::String(text) => {
            if let Some(caps) = REFERENCE_RE.captures(text) {
                if caps.get(0).map(|m| m.as_str().len()) == Some(text.len()) {
                    if let Some(found) = lookup(variables, &caps[1]) {
                        return found.clone();
                    }
                }
            }
            Value::String(substitute(text, variables))
        }
        Value::Array(items) => Value::Array(items.iter().map(|item| render_value(item, variables)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), render_value(item, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Best-effort numeric view used by comparisons and counters.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(text) => !text.is_empty() && text != "false" && text != "0",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Stores whole results as integers so counters stay `1, 2, 3`.
pub fn number_value(number: f64) -> Value {
    if number.fract() == 0.0 && number.abs() < 9.0e15 {
        Value::from(number as i64)
    } else {
        Value::from(number)
    }
}
