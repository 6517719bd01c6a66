//! Per-action lifecycle tracking

use crate::runtime::graph::ActionKind;
use crate::runtime::process::HandleId;
use serde::Serialize;
use std::fmt;

/// Lifecycle of one action attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    ConditionEvaluated,
    Skipped,
    Running,
    Succeeded,
    Failed,
}

impl ActionState {
    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Errors raised while evaluating the condition or building the action
    /// fail it before it ever runs.
    pub fn can_transition_to(self, next: ActionState) -> bool {
        use ActionState::*;
        matches!(
            (self, next),
            (Pending, ConditionEvaluated)
                | (Pending, Failed)
                | (ConditionEvaluated, Skipped)
                | (ConditionEvaluated, Running)
                | (ConditionEvaluated, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionState::Skipped | ActionState::Succeeded | ActionState::Failed
        )
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionState::Pending => "pending",
            ActionState::ConditionEvaluated => "condition-evaluated",
            ActionState::Skipped => "skipped",
            ActionState::Running => "running",
            ActionState::Succeeded => "succeeded",
            ActionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Rejected state change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal transition for '{label}': {from} -> {to}")]
pub struct TransitionError {
    pub label: String,
    pub from: ActionState,
    pub to: ActionState,
}

/// One action attempt as recorded by the executor
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub label: String,
    pub kind: ActionKind,
    pub state: ActionState,
    /// Process started by this action, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<HandleId>,
}

impl ActionRecord {
    pub fn new(label: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            label: label.into(),
            kind,
            state: ActionState::Pending,
            handle: None,
        }
    }

    pub fn transition(&mut self, next: ActionState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                label: self.label.clone(),
                from: self.state,
                to: next,
            });
        }
        log::trace!("{}: {} -> {}", self.label, self.state, next);
        self.state = next;
        Ok(())
    }
}

/// Ordered record of every action attempt of one execution
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub actions: Vec<ActionRecord>,
}

impl ExecutionReport {
    /// Append a record and return its index
    pub fn push(&mut self, record: ActionRecord) -> usize {
        self.actions.push(record);
        self.actions.len() - 1
    }

    pub fn count(&self, state: ActionState) -> usize {
        self.actions.iter().filter(|r| r.state == state).count()
    }

    /// Records of a given kind, in execution order
    pub fn of_kind(&self, kind: ActionKind) -> impl Iterator<Item = &ActionRecord> {
        self.actions.iter().filter(move |r| r.kind == kind)
    }
}
