//! Registry of known deployment steps.

use std::collections::{HashMap, HashSet};

use crate::{DeployError, Step};

/// All known steps, indexed by name.
///
/// Registration order is preserved and used to break ties when ordering steps, so plans
/// are stable from one run to the next.
#[derive(Debug, Default, Clone)]
pub struct StepRegistry {
    steps: Vec<Step>,
    index: HashMap<String, usize>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `step`, failing with [`DeployError::DuplicateStep`] if its name is taken.
    pub fn register(&mut self, step: Step) -> Result<(), DeployError> {
        if self.index.contains_key(step.name()) {
            return Err(DeployError::DuplicateStep(step.name().to_string()));
        }

        tracing::trace!(
            step = %step.name(),
            dependencies = ?step.dependencies(),
            "Registered step"
        );

        self.index.insert(step.name().to_string(), self.steps.len());
        self.steps.push(step);
        Ok(())
    }

    /// Look up a step by name.
    pub fn resolve(&self, name: &str) -> Result<&Step, DeployError> {
        self.index
            .get(name)
            .map(|&i| &self.steps[i])
            .ok_or_else(|| DeployError::UnknownStep {
                name: name.to_string(),
                required_by: None,
            })
    }

    /// Position of `name` in registration order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Expand `names` to include every direct and indirect dependency.
    ///
    /// The result is in registration order. Fails with [`DeployError::UnknownStep`] if a
    /// requested name or any declared dependency is not registered.
    pub fn transitive_closure<I, S>(&self, names: I) -> Result<Vec<&Step>, DeployError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut visited: HashSet<usize> = HashSet::new();
        let mut stack: Vec<(String, Option<String>)> = names
            .into_iter()
            .map(|name| (name.as_ref().to_string(), None))
            .collect();

        while let Some((name, required_by)) = stack.pop() {
            let position = self
                .position(&name)
                .ok_or_else(|| DeployError::UnknownStep {
                    name: name.clone(),
                    required_by: required_by.clone(),
                })?;

            if !visited.insert(position) {
                continue;
            }

            let step = &self.steps[position];
            stack.extend(
                step.dependencies()
                    .iter()
                    .map(|dep| (dep.clone(), Some(step.name().to_string()))),
            );
        }

        let mut positions: Vec<usize> = visited.into_iter().collect();
        positions.sort_unstable();
        Ok(positions.into_iter().map(|i| &self.steps[i]).collect())
    }

    /// Iterate over steps in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(Step::name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use alloy_core::primitives::Address;

    use super::*;
    use crate::{DeployResult, StepContext};

    fn step(name: &str, deps: &[&str]) -> Step {
        Step::new(name, |_ctx: StepContext| async {
            anyhow::Ok(DeployResult::fresh(Address::ZERO, vec![]))
        })
        .with_dependencies(deps.iter().copied())
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = StepRegistry::new();
        registry.register(step("Wallet", &[])).unwrap();

        let err = registry.register(step("Wallet", &["Other"])).unwrap_err();
        assert!(matches!(err, DeployError::DuplicateStep(name) if name == "Wallet"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_unknown_step() {
        let registry = StepRegistry::new();
        let err = registry.resolve("Wallet").unwrap_err();
        assert!(matches!(
            err,
            DeployError::UnknownStep { name, required_by: None } if name == "Wallet"
        ));
    }

    #[test]
    fn test_transitive_closure_includes_indirect_dependencies() {
        let mut registry = StepRegistry::new();
        registry.register(step("Token", &[])).unwrap();
        registry.register(step("Wallet", &["Token"])).unwrap();
        registry.register(step("WalletFactory", &["Wallet"])).unwrap();
        registry.register(step("Unrelated", &[])).unwrap();

        let closure: Vec<_> = registry
            .transitive_closure(["WalletFactory"])
            .unwrap()
            .into_iter()
            .map(Step::name)
            .collect();

        assert_eq!(closure, vec!["Token", "Wallet", "WalletFactory"]);
    }

    #[test]
    fn test_transitive_closure_unknown_dependency() {
        let mut registry = StepRegistry::new();
        registry.register(step("WalletFactory", &["Wallet"])).unwrap();

        let err = registry.transitive_closure(["WalletFactory"]).unwrap_err();
        assert!(matches!(
            err,
            DeployError::UnknownStep { name, required_by: Some(by) }
                if name == "Wallet" && by == "WalletFactory"
        ));
    }

    #[test]
    fn test_transitive_closure_tolerates_cycles() {
        let mut registry = StepRegistry::new();
        registry.register(step("A", &["B"])).unwrap();
        registry.register(step("B", &["A"])).unwrap();

        let closure = registry.transitive_closure(["A"]).unwrap();
        assert_eq!(closure.len(), 2);
    }
}
