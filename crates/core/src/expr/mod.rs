//! Restricted boolean expression language used by risk rules, approval
//! rules and database group membership.
//!
//! The grammar is closed: string/integer/boolean literals, dotted attribute
//! names, comparisons (`== != < <= > >=`), `in [...]` lists, logical
//! `&& || !`, parentheses and the string methods `startsWith`, `endsWith`,
//! `contains` and `matches`. Expressions are parsed once into an immutable
//! tree and evaluated against a [`Context`] by structural recursion.
//!
//! ```text
//! resource.database_name.startsWith("employee_")
//!     && resource.environment_name == "environments/prod"
//! ```

mod eval;
mod lexer;
mod parser;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Values and context
// ---------------------------------------------------------------------------

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    String(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::String(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// Attribute bindings an expression is evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    attrs: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attrs.insert(name.into(), value.into());
    }

    /// Bind `name` both bare and under the `resource.` prefix.
    pub fn insert_resource(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        self.attrs.insert(format!("resource.{name}"), value.clone());
        self.attrs.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attrs.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A malformed expression, rejected before it is stored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid expression at offset {position}: {message}")]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

impl From<ParseError> for CoreError {
    fn from(err: ParseError) -> Self {
        CoreError::Validation(err.to_string())
    }
}

/// Evaluation failure. Callers treat these as non-fatal diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    #[error("unknown attribute '{0}'")]
    UnknownAttribute(String),

    #[error("type mismatch: {op} is not defined for {left} and {right}")]
    TypeMismatch {
        op: String,
        left: &'static str,
        right: &'static str,
    },

    #[error("expected bool, found {0}")]
    NotBoolean(&'static str),
}

impl From<EvaluationError> for CoreError {
    fn from(err: EvaluationError) -> Self {
        CoreError::Evaluation(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

/// A parsed, immutable rule expression.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: parser::Node,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let root = parser::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to a boolean. `&&` and `||` short-circuit, so an unknown
    /// attribute on the untaken side is not an error.
    pub fn evaluate(&self, ctx: &Context) -> Result<bool, EvaluationError> {
        eval::eval_bool(&self.root, ctx)
    }

    /// Every attribute name the expression reads, sorted.
    pub fn referenced_attributes(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        eval::collect_attributes(&self.root, &mut out);
        out
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(expression: &str, ctx: &Context) -> Result<bool, CoreError> {
    Ok(Expression::parse(expression)?.evaluate(ctx)?)
}
