//! Error taxonomy for planning and executing deployments.

use thiserror::Error;

/// Fatal errors raised while planning or executing a deployment run.
///
/// Verification failures are deliberately absent: they are reported through
/// [`crate::VerificationError`] and never abort a run.
#[derive(Debug, Error)]
pub enum DeployError {
    /// A requested tag or a declared dependency does not name a registered step.
    #[error("unknown step `{name}`{}", required_by_suffix(.required_by))]
    UnknownStep {
        name: String,
        /// The step that declared the dependency, if the name came from one.
        required_by: Option<String>,
    },

    /// A step with the same name is already registered.
    #[error("step `{0}` is already registered")]
    DuplicateStep(String),

    /// The requested closure contains a dependency cycle.
    #[error("cyclic dependency between steps: {}", .steps.join(", "))]
    CyclicDependency { steps: Vec<String> },

    /// A salt that is not a 32-byte value was supplied for address derivation.
    #[error("invalid salt: {0}")]
    InvalidSalt(String),

    /// A step action returned an error.
    #[error("step `{step}` failed: {cause:#}")]
    StepExecutionFailed { step: String, cause: anyhow::Error },

    /// Reading or writing the deployment ledger failed.
    #[error("ledger error for step `{step}`: {cause:#}")]
    Ledger { step: String, cause: anyhow::Error },
}

impl DeployError {
    /// Wrap an action failure for `step`.
    pub fn step_failed(step: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self::StepExecutionFailed {
            step: step.into(),
            cause: cause.into(),
        }
    }

    /// Wrap a ledger I/O failure for `step`.
    pub fn ledger(step: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self::Ledger {
            step: step.into(),
            cause: cause.into(),
        }
    }

    /// Whether this error was raised before any step was executed.
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownStep { .. } | Self::DuplicateStep(_) | Self::CyclicDependency { .. }
        )
    }
}

fn required_by_suffix(required_by: &Option<String>) -> String {
    required_by
        .as_ref()
        .map(|step| format!(" (required by `{step}`)"))
        .unwrap_or_default()
}
