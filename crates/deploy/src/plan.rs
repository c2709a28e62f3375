//! Execution planning: closure expansion, topological ordering and cycle detection.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{DeployError, StepRegistry};

/// Tag meaning "every registered step".
pub const ALL_TAG: &str = "all";

/// Which steps a run should execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepSelection {
    /// Every registered step.
    All,
    /// The named steps and their dependencies.
    Tags(Vec<String>),
}

impl StepSelection {
    /// Build a selection from user-supplied tags.
    ///
    /// An empty list or one containing [`ALL_TAG`] selects every step.
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        if tags.is_empty() || tags.iter().any(|tag| tag == ALL_TAG) {
            Self::All
        } else {
            Self::Tags(tags)
        }
    }
}

/// An ordered list of steps in which every dependency precedes its dependents.
///
/// `layers` groups steps whose dependencies are all in earlier layers; steps in the same
/// layer do not depend on each other. `order` is the layers flattened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub order: Vec<String>,
    pub layers: Vec<Vec<String>>,
}

impl ExecutionPlan {
    /// Plan `selection` against `registry`.
    ///
    /// Fails with [`DeployError::UnknownStep`] if the closure cannot be expanded and with
    /// [`DeployError::CyclicDependency`] listing every step that could not be ordered.
    pub fn build(registry: &StepRegistry, selection: &StepSelection) -> Result<Self, DeployError> {
        let closure = match selection {
            StepSelection::All => registry.transitive_closure(registry.names())?,
            StepSelection::Tags(tags) => registry.transitive_closure(tags)?,
        };

        let mut placed: HashSet<&str> = HashSet::with_capacity(closure.len());
        let mut remaining = closure;
        let mut layers: Vec<Vec<String>> = Vec::new();

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|step| {
                step.dependencies()
                    .iter()
                    .all(|dep| placed.contains(dep.as_str()))
            });

            if ready.is_empty() {
                let steps: Vec<String> = blocked.iter().map(|s| s.name().to_string()).collect();
                tracing::error!(steps = ?steps, "Dependency cycle detected");
                return Err(DeployError::CyclicDependency { steps });
            }

            placed.extend(ready.iter().map(|&step| step.name()));
            layers.push(ready.iter().map(|step| step.name().to_string()).collect());
            remaining = blocked;
        }

        let order = layers.iter().flatten().cloned().collect();
        Ok(Self { order, layers })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Position of `name` in the plan.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|step| step == name)
    }
}
