//! Condition expressions evaluated over the variable environment.

use rpa_core_types::Variables;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::vars::{as_number, is_truthy, lookup, render_value, value_to_string};

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[serde(alias = "equals", alias = "==")]
    Eq,
    #[serde(alias = "not_equals", alias = "!=")]
    Ne,
    #[serde(alias = "less_than", alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Le,
    #[serde(alias = "greater_than", alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Ge,
    Contains,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Contains => "contains",
        }
    }
}

/// Operand of a comparison: a variable reference or a literal. String
/// literals are `${}`-substituted before comparing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Var { var: String },
    Value(Value),
}

impl Operand {
    pub fn var(name: impl Into<String>) -> Self {
        Operand::Var { var: name.into() }
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Operand::Value(value.into())
    }

    fn resolve(&self, variables: &Variables) -> Option<Value> {
        match self {
            Operand::Var { var } => lookup(variables, var).cloned(),
            Operand::Value(value) => Some(render_value(value, variables)),
        }
    }
}

/// Condition expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    /// Variable is set and truthy
    Truthy(String),
    /// Variable is set, whatever its value
    Exists(String),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    /// Shorthand such as `i < 3`, compiled to `Compare` at validation time
    Expr(String),
}

impl Condition {
    /// Replaces every `Expr` with its parsed form.
    pub fn compile(&self) -> Result<Condition, String> {
        Ok(match self {
            Condition::Expr(text) => parse_expr(text)?,
            Condition::And(items) => Condition::And(
                items
                    .iter()
                    .map(Condition::compile)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Condition::Or(items) => Condition::Or(
                items
                    .iter()
                    .map(Condition::compile)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Condition::Not(inner) => Condition::Not(Box::new(inner.compile()?)),
            other => other.clone(),
        })
    }

    pub fn evaluate(&self, variables: &Variables) -> Result<bool, String> {
        match self {
            Condition::Compare { left, op, right } => {
                let left = left.resolve(variables).unwrap_or(Value::Null);
                let right = right.resolve(variables).unwrap_or(Value::Null);
                Ok(compare(&left, *op, &right))
            }
            Condition::Truthy(name) => Ok(lookup(variables, name).map(is_truthy).unwrap_or(false)),
            Condition::Exists(name) => Ok(lookup(variables, name).is_some()),
            Condition::And(items) => {
                for item in items {
                    if !item.evaluate(variables)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or(items) => {
                for item in items {
                    if item.evaluate(variables)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not(inner) => Ok(!inner.evaluate(variables)?),
            Condition::Expr(text) => parse_expr(text)?.evaluate(variables),
        }
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    let numbers = match (left, right) {
        (Value::Null, _) | (_, Value::Null) => None,
        _ => as_number(left).zip(as_number(right)),
    };
    match op {
        CompareOp::Eq => match numbers {
            Some((a, b)) => a == b,
            None => value_to_string(left) == value_to_string(right),
        },
        CompareOp::Ne => !compare(left, CompareOp::Eq, right),
        CompareOp::Contains => match left {
            Value::Array(items) => items.iter().any(|item| compare(item, CompareOp::Eq, right)),
            other => value_to_string(other).contains(&value_to_string(right)),
        },
        CompareOp::Lt => numbers.map(|(a, b)| a < b).unwrap_or(false),
        CompareOp::Le => numbers.map(|(a, b)| a <= b).unwrap_or(false),
        CompareOp::Gt => numbers.map(|(a, b)| a > b).unwrap_or(false),
        CompareOp::Ge => numbers.map(|(a, b)| a >= b).unwrap_or(false),
    }
}

const OPERATORS: [(&str, CompareOp); 7] = [
    ("==", CompareOp::Eq),
    ("!=", CompareOp::Ne),
    ("<=", CompareOp::Le),
    (">=", CompareOp::Ge),
    ("<", CompareOp::Lt),
    (">", CompareOp::Gt),
    (" contains ", CompareOp::Contains),
];

/// Parses `<operand> <op> <operand>`. Bare identifiers are variables;
/// numbers, booleans, `null` and quoted strings are literals; anything with
/// `${` is a template.
pub fn parse_expr(text: &str) -> Result<Condition, String> {
    let text = text.trim();
    if let Some((pos, symbol, op)) = find_operator(text) {
        let left = parse_operand(&text[..pos])?;
        let right = parse_operand(&text[pos + symbol.len()..])?;
        return Ok(Condition::Compare { left, op, right });
    }
    // A lone identifier tests truthiness.
    match parse_operand(text)? {
        Operand::Var { var } => Ok(Condition::Truthy(var)),
        Operand::Value(_) => Err(format!("expression '{text}' has no comparison operator")),
    }
}

/// Leftmost operator outside quoted literals. Two-character symbols come
/// first in the table so `<=` wins over `<` at the same position.
fn find_operator(text: &str) -> Option<(usize, &'static str, CompareOp)> {
    let mut quote: Option<char> = None;
    for (pos, c) in text.char_indices() {
        match quote {
            Some(open) => {
                if c == open {
                    quote = None;
                }
            }
            None if c == '\'' || c == '"' => quote = Some(c),
            None => {
                let rest = &text[pos..];
                if let Some((symbol, op)) = OPERATORS.iter().find(|(symbol, _)| rest.starts_with(symbol)) {
                    return Some((pos, *symbol, *op));
                }
            }
        }
    }
    None
}

fn parse_operand(raw: &str) -> Result<Operand, String> {
    let token = raw.trim();
    if token.is_empty() {
        return Err("missing operand".to_string());
    }
    let quoted = token.len() >= 2
        && ((token.starts_with('"') && token.ends_with('"'))
            || (token.starts_with('\'') && token.ends_with('\'')));
    if quoted {
        return Ok(Operand::value(&token[1..token.len() - 1]));
    }
    if token.contains("${") {
        return Ok(Operand::value(token));
    }
    match token {
        "true" => return Ok(Operand::value(true)),
        "false" => return Ok(Operand::value(false)),
        "null" => return Ok(Operand::Value(Value::Null)),
        _ => {}
    }
    if let Ok(number) = token.parse::<i64>() {
        return Ok(Operand::value(number));
    }
    if let Ok(number) = token.parse::<f64>() {
        return Ok(Operand::value(number));
    }
    let is_path = token
        .split('.')
        .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if is_path && !token.starts_with(|c: char| c.is_ascii_digit()) {
        Ok(Operand::var(token))
    } else {
        Err(format!("cannot parse operand '{token}'"))
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::Compare { left, op, right } => {
                let side = |operand: &Operand| match operand {
                    Operand::Var { var } => var.clone(),
                    Operand::Value(value) => value.to_string(),
                };
                write!(f, "{} {} {}", side(left), op.symbol(), side(right))
            }
            Condition::Truthy(name) => write!(f, "{name}"),
            Condition::Exists(name) => write!(f, "exists({name})"),
            Condition::And(items) => write!(f, "and[{}]", items.len()),
            Condition::Or(items) => write!(f, "or[{}]", items.len()),
            Condition::Not(inner) => write!(f, "not({inner})"),
            Condition::Expr(text) => f.write_str(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn shorthand_compiles_to_compare() {
        let compiled = Condition::Expr("i < 3".into()).compile().unwrap();
        assert_eq!(
            compiled,
            Condition::Compare {
                left: Operand::var("i"),
                op: CompareOp::Lt,
                right: Operand::value(3),
            }
        );
        assert!(compiled.evaluate(&vars(&[("i", json!(2))])).unwrap());
        assert!(!compiled.evaluate(&vars(&[("i", json!(3))])).unwrap());
    }

    #[test]
    fn equality_falls_back_to_text() {
        let cond = parse_expr("status == 'ok'").unwrap();
        assert!(cond.evaluate(&vars(&[("status", json!("ok"))])).unwrap());
        let numeric = parse_expr("count == 3").unwrap();
        assert!(numeric.evaluate(&vars(&[("count", json!("3.0"))])).unwrap());
    }

    #[test]
    fn ordering_on_non_numbers_is_false() {
        let cond = parse_expr("name > 3").unwrap();
        assert!(!cond.evaluate(&vars(&[("name", json!("ada"))])).unwrap());
        // Missing variables never satisfy an ordering.
        assert!(!parse_expr("missing < 3").unwrap().evaluate(&Variables::new()).unwrap());
    }

    #[test]
    fn contains_over_text_and_arrays() {
        let text = parse_expr("title contains 'Shop'").unwrap();
        assert!(text.evaluate(&vars(&[("title", json!("My Shop"))])).unwrap());
        let list = Condition::Compare {
            left: Operand::var("tags"),
            op: CompareOp::Contains,
            right: Operand::value("b"),
        };
        assert!(list.evaluate(&vars(&[("tags", json!(["a", "b"]))])).unwrap());
    }

    #[test]
    fn boolean_combinators() {
        let cond = Condition::And(vec![
            Condition::Exists("a".into()),
            Condition::Not(Box::new(Condition::Truthy("b".into()))),
        ]);
        assert!(cond.evaluate(&vars(&[("a", json!(null)), ("b", json!(0))])).unwrap());
        assert!(!cond.evaluate(&vars(&[("b", json!(0))])).unwrap());
    }

    #[test]
    fn operators_inside_quoted_literals_are_text() {
        let ne = parse_expr("status != 'a==b'").unwrap();
        assert_eq!(
            ne,
            Condition::Compare {
                left: Operand::var("status"),
                op: CompareOp::Ne,
                right: Operand::value("a==b"),
            }
        );
        assert!(!ne.evaluate(&vars(&[("status", json!("a==b"))])).unwrap());

        let tag = parse_expr("title contains \"<b>\"").unwrap();
        assert!(tag.evaluate(&vars(&[("title", json!("<b>Sale</b>"))])).unwrap());

        let le = parse_expr("count <= 2").unwrap();
        assert!(le.evaluate(&vars(&[("count", json!(2))])).unwrap());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_expr("< 3").is_err());
        assert!(parse_expr("42").is_err());
        assert!(parse_expr("a-b == 1").is_err());
    }

    #[test]
    fn deserializes_from_yaml_like_json() {
        let cond: Condition = serde_json::from_value(json!({
            "compare": {"left": {"var": "i"}, "op": "less_than", "right": 3}
        }))
        .unwrap();
        assert!(cond.evaluate(&vars(&[("i", json!(1))])).unwrap());
    }
}
