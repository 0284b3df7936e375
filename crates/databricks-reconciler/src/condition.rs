//! Success conditions over status documents.
//!
//! A condition is a comma separated conjunction of requirements, each one of
//! `path op value` (`=`, `==`, `!=`, `>`, `>=`, `<`, `<=`),
//! `path in (a, b)`, `path notin (a, b)`, `path` (set) or `!path` (unset):
//!
//! ```text
//! status.metadata.state.life_cycle_state != PENDING, status.metadata.state.life_cycle_state != RUNNING
//! status.job_status.job_id > 0
//! ```

use crate::projector::{lookup, Projection};
use serde_json::Value;
use std::fmt;

/// Condition parse errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    #[error("empty condition")]
    Empty,

    #[error("missing field path in requirement {0:?}")]
    MissingPath(String),

    #[error("missing value in requirement {0:?}")]
    MissingValue(String),

    #[error("unknown operator in requirement {0:?}")]
    UnknownOperator(String),

    #[error("malformed value list in requirement {0:?}")]
    MalformedList(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    NotIn,
    Exists,
    NotExists,
}

impl Operator {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::In => "in",
            Self::NotIn => "notin",
            Self::Exists => "",
            Self::NotExists => "!",
        }
    }
}

/// One requirement of a condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub path: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Requirement {
    pub fn new(path: &str, operator: Operator, values: &[&str]) -> Self {
        Self {
            path: path.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn matches(&self, document: &Value) -> bool {
        let actual = match lookup(document, &self.path) {
            Projection::Unset => return self.operator == Operator::NotExists,
            Projection::Value(value) => scalar(&value),
        };

        let first = self.values.first().map(String::as_str).unwrap_or_default();
        match self.operator {
            Operator::Exists => true,
            Operator::NotExists => false,
            Operator::Eq => equals(&actual, first),
            Operator::Ne => !equals(&actual, first),
            Operator::In => self.values.iter().any(|v| equals(&actual, v)),
            Operator::NotIn => !self.values.iter().any(|v| equals(&actual, v)),
            Operator::Gt => compare(&actual, first, |a, b| a > b),
            Operator::Ge => compare(&actual, first, |a, b| a >= b),
            Operator::Lt => compare(&actual, first, |a, b| a < b),
            Operator::Le => compare(&actual, first, |a, b| a <= b),
        }
    }

    fn parse(input: &str) -> Result<Self, ConditionError> {
        let text = input.trim();
        if let Some(path) = text.strip_prefix('!') {
            let path = normalize_path(path);
            if path.is_empty() {
                return Err(ConditionError::MissingPath(input.to_string()));
            }
            return Ok(Self {
                path,
                operator: Operator::NotExists,
                values: Vec::new(),
            });
        }

        let split = text
            .find(|c: char| c.is_whitespace() || "=!<>".contains(c))
            .unwrap_or(text.len());
        let path = normalize_path(&text[..split]);
        if path.is_empty() {
            return Err(ConditionError::MissingPath(input.to_string()));
        }

        let rest = text[split..].trim();
        if rest.is_empty() {
            return Ok(Self {
                path,
                operator: Operator::Exists,
                values: Vec::new(),
            });
        }

        for (keyword, operator) in [("notin", Operator::NotIn), ("in", Operator::In)] {
            if let Some(list) = rest.strip_prefix(keyword) {
                if list.starts_with(|c: char| c.is_whitespace() || c == '(') {
                    return Ok(Self {
                        path,
                        operator,
                        values: parse_list(list, input)?,
                    });
                }
            }
        }

        for (symbol, operator) in [
            ("==", Operator::Eq),
            ("!=", Operator::Ne),
            (">=", Operator::Ge),
            ("<=", Operator::Le),
            ("=", Operator::Eq),
            (">", Operator::Gt),
            ("<", Operator::Lt),
        ] {
            if let Some(value) = rest.strip_prefix(symbol) {
                let value = unquote(value.trim());
                if value.is_empty() {
                    return Err(ConditionError::MissingValue(input.to_string()));
                }
                return Ok(Self {
                    path,
                    operator,
                    values: vec![value.to_string()],
                });
            }
        }

        Err(ConditionError::UnknownOperator(input.to_string()))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Exists => f.write_str(&self.path),
            Operator::NotExists => write!(f, "!{}", self.path),
            Operator::In | Operator::NotIn => write!(
                f,
                "{} {} ({})",
                self.path,
                self.operator.as_str(),
                self.values.join(", ")
            ),
            _ => write!(
                f,
                "{} {} {}",
                self.path,
                self.operator.as_str(),
                self.values.join("")
            ),
        }
    }
}

/// Conjunction of requirements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    requirements: Vec<Requirement>,
}

impl Condition {
    pub fn new(requirements: Vec<Requirement>) -> Self {
        Self { requirements }
    }

    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let requirements = split_top_level(input)
            .into_iter()
            .filter(|part| !part.trim().is_empty())
            .map(Requirement::parse)
            .collect::<Result<Vec<_>, _>>()?;

        if requirements.is_empty() {
            return Err(ConditionError::Empty);
        }
        Ok(Self { requirements })
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// True when every requirement holds on `document`
    pub fn evaluate(&self, document: &Value) -> bool {
        self.requirements.iter().all(|r| r.matches(document))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, requirement) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{requirement}")?;
        }
        Ok(())
    }
}

/// Splits on commas outside parentheses
fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn parse_list(list: &str, input: &str) -> Result<Vec<String>, ConditionError> {
    let inner = list
        .trim()
        .strip_prefix('(')
        .and_then(|l| l.strip_suffix(')'))
        .ok_or_else(|| ConditionError::MalformedList(input.to_string()))?;

    let values: Vec<String> = inner
        .split(',')
        .map(|v| unquote(v.trim()).to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return Err(ConditionError::MalformedList(input.to_string()));
    }
    Ok(values)
}

/// Accepts `status.a`, `.status.a` and `{.status.a}`
pub(crate) fn normalize_path(path: &str) -> String {
    path.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .trim_start_matches('.')
        .to_string()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(quote).and_then(|v| v.strip_suffix(quote)) {
            return inner;
        }
    }
    value
}

/// Textual form of a JSON value as pipelines compare it
pub(crate) fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn equals(actual: &str, expected: &str) -> bool {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => actual == expected,
    }
}

fn compare(actual: &str, expected: &str, op: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => op(a, b),
        _ => false,
    }
}
