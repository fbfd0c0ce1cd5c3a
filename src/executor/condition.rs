//! Condition evaluation for when/changed_when/failed_when.
//!
//! The executor only needs one operation from an expression language:
//! evaluate an expression to a boolean against a variable map. The
//! [`ConditionEvaluator`] trait captures that. [`AlwaysTrue`] is a trivial
//! reference implementation; [`TemplateEvaluator`] evaluates Jinja-style
//! expressions with minijinja.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Errors raised by condition evaluation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    /// The expression could not be parsed
    #[error("Invalid expression '{expr}': {message}")]
    Syntax { expr: String, message: String },

    /// The expression parsed but could not be evaluated
    #[error("Failed to evaluate '{expr}': {message}")]
    Evaluation { expr: String, message: String },
}

/// Boolean evaluation of guard expressions
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate `expr` against `vars`
    fn evaluate_boolean(
        &self,
        expr: &str,
        vars: &Map<String, JsonValue>,
    ) -> Result<bool, ConditionError>;
}

/// Evaluator that accepts every expression
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysTrue;

impl ConditionEvaluator for AlwaysTrue {
    fn evaluate_boolean(
        &self,
        _expr: &str,
        _vars: &Map<String, JsonValue>,
    ) -> Result<bool, ConditionError> {
        Ok(true)
    }
}

/// Jinja-style expression evaluator
pub struct TemplateEvaluator {
    env: Environment<'static>,
}

impl TemplateEvaluator {
    /// Undefined variables are falsy
    pub fn new() -> Self {
        Self {
            env: Environment::new(),
        }
    }

    /// Undefined variables are an error
    pub fn strict() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }
}

impl Default for TemplateEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEvaluator").finish_non_exhaustive()
    }
}

/// Strip one level of `{{ }}` around a bare expression
fn unwrap_braces(expr: &str) -> &str {
    let trimmed = expr.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

impl ConditionEvaluator for TemplateEvaluator {
    fn evaluate_boolean(
        &self,
        expr: &str,
        vars: &Map<String, JsonValue>,
    ) -> Result<bool, ConditionError> {
        let source = unwrap_braces(expr);
        if source.is_empty() {
            return Ok(true);
        }
        match source.to_lowercase().as_str() {
            "yes" | "on" => return Ok(true),
            "no" | "off" => return Ok(false),
            _ => {}
        }

        let compiled = self
            .env
            .compile_expression(source)
            .map_err(|e| ConditionError::Syntax {
                expr: expr.to_string(),
                message: e.to_string(),
            })?;
        let value = compiled.eval(vars).map_err(|e| ConditionError::Evaluation {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;
        Ok(value.is_true())
    }
}
