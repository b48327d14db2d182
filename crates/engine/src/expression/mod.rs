//! Expression language used in step configuration.
//!
//! An expression is minijinja expression syntax extended with bracketed
//! data-path references such as `[fetch.output.rows.0.id]` and C-style
//! boolean operators. Parsing replaces every reference with a bound
//! variable, so referenced values keep their JSON type during evaluation.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use minijinja::{Environment, UndefinedBehavior, Value};
use regex::Regex;

use crate::error::{AppError, AppResult};

/// Which mapping of a step a reference reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Input,
    Output,
}

/// A `[step.section.path]` reference found in an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataReference {
    pub step: String,
    pub section: Section,
    pub path: Vec<String>,
    /// Name the reference is bound to during evaluation.
    pub variable: String,
}

impl DataReference {
    /// Read the referenced value out of the step's mapping.
    pub fn resolve(&self, data: &serde_json::Map<String, serde_json::Value>) -> AppResult<serde_json::Value> {
        let missing = || {
            AppError::DataPath(format!(
                "Key '{}' not found in {} of step '{}'",
                self.path.join("."),
                self.section_name(),
                self.step
            ))
        };

        let (first, rest) = self.path.split_first().ok_or_else(missing)?;
        let mut current = data.get(first).ok_or_else(missing)?;
        for segment in rest {
            current = match current {
                serde_json::Value::Object(map) => map.get(segment),
                serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(missing)?;
        }
        Ok(current.clone())
    }

    fn section_name(&self) -> &'static str {
        match self.section {
            Section::Input => "input",
            Section::Output => "output",
        }
    }
}

/// A parsed expression ready for evaluation.
#[derive(Debug, Clone)]
pub struct ParsedExpression {
    pub source: String,
    /// Source with references replaced and operators rewritten.
    pub rewritten: String,
    pub references: Vec<DataReference>,
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\[\s*([^\[\]\.\s]+)\.(input|output)\.([A-Za-z0-9_\-\.]+?)\s*\]")
            .expect("reference pattern is valid")
    })
}

/// Scan an expression for data-path references and rewrite it into
/// plain minijinja syntax.
pub fn parse(source: &str) -> AppResult<ParsedExpression> {
    if source.trim().is_empty() {
        return Err(AppError::Expression("Expression is empty".to_string()));
    }

    let mut references = Vec::new();
    let substituted = reference_pattern().replace_all(source, |caps: &regex::Captures<'_>| {
        let variable = format!("__ref_{}", references.len());
        let section = if &caps[2] == "input" {
            Section::Input
        } else {
            Section::Output
        };
        references.push(DataReference {
            step: caps[1].to_string(),
            section,
            path: caps[3].split('.').map(str::to_string).collect(),
            variable: variable.clone(),
        });
        variable
    });

    Ok(ParsedExpression {
        source: source.to_string(),
        rewritten: rewrite_operators(&substituted),
        references,
    })
}

/// Rewrite `&&`, `||` and unary `!` to their keyword forms, leaving
/// string literals alone.
pub fn rewrite_operators(expr: &str) -> String {
    let chars: Vec<char> = expr.chars().collect();
    let mut out = String::with_capacity(expr.len() + 8);
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = next {
                    out.push(escaped);
                    i += 1;
                }
            } else if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match (c, next) {
            ('\'', _) | ('"', _) => {
                quote = Some(c);
                out.push(c);
            }
            ('&', Some('&')) => {
                out.push_str(" and ");
                i += 1;
            }
            ('|', Some('|')) => {
                out.push_str(" or ");
                i += 1;
            }
            ('!', Some('=')) => {
                out.push_str("!=");
                i += 1;
            }
            ('!', _) => out.push_str(" not "),
            _ => out.push(c),
        }
        i += 1;
    }

    out
}

/// Convert JSON into a minijinja value.
pub fn json_to_minijinja(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::from(()),
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(f) = n.as_f64() {
                Value::from(f)
            } else {
                Value::from(())
            }
        }
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(items) => {
            Value::from(items.iter().map(json_to_minijinja).collect::<Vec<_>>())
        }
        serde_json::Value::Object(map) => {
            let items: HashMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_minijinja(v)))
                .collect();
            Value::from_object(items)
        }
    }
}

/// Evaluates rewritten expressions against bound variables.
pub struct ExpressionEngine {
    env: Environment<'static>,
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }

    /// Evaluate `expression` with `bindings` as its variables.
    pub fn eval(
        &self,
        expression: &ParsedExpression,
        bindings: &BTreeMap<String, serde_json::Value>,
    ) -> AppResult<serde_json::Value> {
        let compiled = self.env.compile_expression(&expression.rewritten).map_err(|e| {
            AppError::Expression(format!("Cannot parse '{}': {}", expression.source, e))
        })?;

        let context: HashMap<String, Value> = bindings
            .iter()
            .map(|(k, v)| (k.clone(), json_to_minijinja(v)))
            .collect();

        let value = compiled.eval(Value::from_object(context)).map_err(|e| {
            AppError::Expression(format!("Cannot evaluate '{}': {}", expression.source, e))
        })?;

        if value.is_undefined() {
            return Err(AppError::Expression(format!(
                "Expression '{}' produced no value",
                expression.source
            )));
        }

        serde_json::to_value(&value).map_err(AppError::from)
    }
}

/// Interpret an evaluated value as a boolean.
pub fn as_bool(source: &str, value: &serde_json::Value) -> AppResult<bool> {
    match value {
        serde_json::Value::Bool(b) => Ok(*b),
        serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(AppError::Expression(format!(
                "Expression '{}' is not boolean: {}",
                source, s
            ))),
        },
        other => Err(AppError::Expression(format!(
            "Expression '{}' is not boolean: {}",
            source, other
        ))),
    }
}

/// Interpret an evaluated value as a number.
pub fn as_f64(source: &str, value: &serde_json::Value) -> AppResult<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| AppError::Expression(format!("Expression '{}' is not numeric: {}", source, value)))
}

/// Interpret an evaluated value as a string.
pub fn as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
