// src/actions/preflight.rs

//! Side-effect-free parameter validation
//!
//! Preflight runs before anything touches the filesystem or network, so an
//! entire recipe can be checked up front. Errors are collected as a batch
//! rather than failing fast; warnings are advisory and never block.

use super::Registry;
use crate::error::Error;
use crate::params::Params;
use crate::recipe::Recipe;

/// Outcome of validating one step (or a whole recipe)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PreflightResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Append another result, keeping order
    pub fn merge(&mut self, other: PreflightResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Collapse errors into one [`Error::PreflightFailed`], or `None` when valid
    pub fn to_error(&self, action: &str) -> Option<Error> {
        let first = self.errors.first()?;
        let message = match self.errors.len() {
            1 => first.clone(),
            n => format!("{} (and {} more errors)", first, n - 1),
        };
        Some(Error::PreflightFailed {
            action: action.to_string(),
            message,
        })
    }
}

/// Validate one action invocation
///
/// Unknown actions produce a single error. Actions without a preflight
/// check pass by default.
pub fn validate_action(registry: &Registry, name: &str, params: &Params) -> PreflightResult {
    let Some(action) = registry.get(name) else {
        let mut result = PreflightResult::new();
        result.add_error(format!("unknown action '{}'", name));
        return result;
    };

    action.preflight(params).unwrap_or_default()
}

/// Validate every step of a recipe, prefixing messages with the step position
pub fn validate_recipe(registry: &Registry, recipe: &Recipe) -> PreflightResult {
    let mut combined = PreflightResult::new();

    for (index, step) in recipe.steps.iter().enumerate() {
        let prefix = format!("step {} ({})", index + 1, step.action);
        let result = validate_action(registry, &step.action, &step.params);
        for error in result.errors {
            combined.add_error(format!("{}: {}", prefix, error));
        }
        for warning in result.warnings {
            combined.add_warning(format!("{}: {}", prefix, warning));
        }
    }

    combined
}
