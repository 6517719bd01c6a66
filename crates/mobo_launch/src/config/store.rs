//! Configuration store: declared launch arguments, overrides and memoized values

use crate::config::substitution::{EvalContext, Substitution, SubstitutionError};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

/// A named, overridable launch argument
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    /// Unique name within a store
    pub name: String,
    /// Lazy default, evaluated on first read when no override is given
    pub default: Option<Substitution>,
    /// Human-readable description
    pub description: Option<String>,
    /// Allowed values (empty = anything goes)
    pub choices: Vec<String>,
}

impl Argument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            description: None,
            choices: Vec::new(),
        }
    }

    pub fn with_default(mut self, default: impl Into<Substitution>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }
}

/// Table of declared arguments for one scope.
///
/// Group scopes chain to their parent; included graphs get a fresh root store
/// seeded with the overrides given at the inclusion site.
#[derive(Debug, Default)]
pub struct ConfigStore {
    parent: Option<Arc<ConfigStore>>,
    declared: Mutex<IndexMap<String, Argument>>,
    overrides: IndexMap<String, String>,
    /// Override keys declared anywhere in this store's group chain
    consumed: Arc<Mutex<HashSet<String>>>,
    resolved: Mutex<HashMap<String, String>>,
    resolving: Mutex<Vec<String>>,
}

impl ConfigStore {
    /// Create an empty root store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a root store seeded with external overrides
    pub fn with_overrides(overrides: IndexMap<String, String>) -> Self {
        Self {
            overrides,
            ..Self::default()
        }
    }

    /// Create a child store whose lookups fall back to `parent`.
    ///
    /// Overrides given to the parent also apply to declarations in the child.
    pub fn child(parent: &Arc<ConfigStore>) -> Self {
        Self {
            parent: Some(Arc::clone(parent)),
            overrides: parent.overrides.clone(),
            consumed: Arc::clone(&parent.consumed),
            ..Self::default()
        }
    }

    /// Register an argument in this store
    pub fn declare(&self, argument: Argument) -> Result<(), StoreError> {
        let mut declared = lock(&self.declared);
        if declared.contains_key(&argument.name) {
            return Err(StoreError::DuplicateArgument(argument.name));
        }
        log::debug!("Declared argument '{}'", argument.name);
        if self.overrides.contains_key(&argument.name) {
            lock(&self.consumed).insert(argument.name.clone());
        }
        declared.insert(argument.name.clone(), argument);
        Ok(())
    }

    /// Whether this store (not its parents) declares `name`
    pub fn is_declared(&self, name: &str) -> bool {
        lock(&self.declared).contains_key(name)
    }

    /// Whether `name` is visible from this store
    pub fn is_visible(&self, name: &str) -> bool {
        self.is_declared(name)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.is_visible(name))
    }

    /// Resolve an argument to its final value.
    ///
    /// The first successful read fixes the value for the rest of the execution.
    pub fn resolve(&self, name: &str, ctx: &EvalContext<'_>) -> Result<String, SubstitutionError> {
        if let Some(value) = lock(&self.resolved).get(name) {
            return Ok(value.clone());
        }

        let declared = lock(&self.declared).get(name).cloned();
        let Some(argument) = declared else {
            return match &self.parent {
                Some(parent) => parent.resolve(
                    name,
                    &EvalContext {
                        store: parent,
                        ..*ctx
                    },
                ),
                None => Err(StoreError::UndeclaredArgument(name.to_string()).into()),
            };
        };

        let value = if let Some(value) = self.overrides.get(name) {
            value.clone()
        } else if let Some(default) = &argument.default {
            self.evaluate_default(name, default, ctx)?
        } else {
            return Err(StoreError::MissingOverride(name.to_string()).into());
        };

        if !argument.choices.is_empty() && !argument.choices.contains(&value) {
            return Err(StoreError::InvalidChoice {
                name: name.to_string(),
                value,
                choices: argument.choices.clone(),
            }
            .into());
        }

        let mut resolved = lock(&self.resolved);
        Ok(resolved.entry(name.to_string()).or_insert(value).clone())
    }

    fn evaluate_default(
        &self,
        name: &str,
        default: &Substitution,
        ctx: &EvalContext<'_>,
    ) -> Result<String, SubstitutionError> {
        {
            let mut resolving = lock(&self.resolving);
            if resolving.iter().any(|n| n == name) {
                let mut chain = resolving.clone();
                chain.push(name.to_string());
                return Err(StoreError::CyclicArgument(chain.join(" -> ")).into());
            }
            resolving.push(name.to_string());
        }

        let result = default.evaluate(&EvalContext { store: self, ..*ctx });

        lock(&self.resolving).retain(|n| n != name);
        result
    }

    /// Arguments declared in this store, in declaration order
    pub fn arguments(&self) -> Vec<Argument> {
        lock(&self.declared).values().cloned().collect()
    }

    /// Values fixed so far, in declaration order
    pub fn resolved_values(&self) -> IndexMap<String, String> {
        let resolved = lock(&self.resolved);
        lock(&self.declared)
            .keys()
            .filter_map(|name| resolved.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    /// Override keys that no declaration in this store or its child stores consumed
    pub fn unused_overrides(&self) -> Vec<String> {
        let consumed = lock(&self.consumed);
        self.overrides
            .keys()
            .filter(|name| !consumed.contains(*name))
            .cloned()
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Errors raised by the configuration store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Argument '{0}' is already declared")]
    DuplicateArgument(String),

    #[error("Argument '{0}' is not declared")]
    UndeclaredArgument(String),

    #[error("Argument '{0}' has no default and no override was given")]
    MissingOverride(String),

    #[error("Cyclic argument defaults: {0}")]
    CyclicArgument(String),

    #[error("Argument '{name}' got '{value}', expected one of: {}", .choices.join(", "))]
    InvalidChoice {
        name: String,
        value: String,
        choices: Vec<String>,
    },
}
