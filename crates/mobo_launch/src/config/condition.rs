//! Conditions gating whether an action runs

use crate::config::substitution::{EvalContext, Substitution, SubstitutionError};

/// A boolean expression attached to an action.
///
/// Conditions are evaluated right before the action would run and are never
/// cached, so an included graph sees the overrides it was given.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    expression: Substitution,
}

impl Condition {
    /// Run when `expression` is true-like
    pub fn if_true(expression: impl Into<Substitution>) -> Self {
        Self {
            expression: expression.into(),
        }
    }

    /// Run when `expression` is false-like
    pub fn unless(expression: impl Into<Substitution>) -> Self {
        Self {
            expression: Substitution::not(expression),
        }
    }

    /// Combine an optional `if` and an optional `unless` into one condition
    pub fn from_parts(if_true: Option<Substitution>, unless: Option<Substitution>) -> Option<Self> {
        match (if_true, unless) {
            (None, None) => None,
            (Some(expr), None) => Some(Self::if_true(expr)),
            (None, Some(expr)) => Some(Self::unless(expr)),
            (Some(when), Some(unless)) => Some(Self::if_true(Substitution::and(vec![
                when,
                Substitution::not(unless),
            ]))),
        }
    }

    pub fn expression(&self) -> &Substitution {
        &self.expression
    }

    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<bool, SubstitutionError> {
        self.expression.evaluate_bool(ctx)
    }
}

/// Decide whether an action runs; a missing condition always runs
pub fn should_run(
    condition: Option<&Condition>,
    ctx: &EvalContext<'_>,
) -> Result<bool, SubstitutionError> {
    match condition {
        Some(condition) => condition.evaluate(ctx),
        None => Ok(true),
    }
}
