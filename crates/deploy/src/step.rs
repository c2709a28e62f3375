//! Deployment steps.
//!
//! A [`Step`] is a named, idempotent deployment unit with a set of dependencies and an
//! action. The action receives a [`StepContext`] holding the outputs of its dependencies
//! and returns a [`DeployResult`].

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    future::Future,
    sync::Arc,
};

use alloy_core::primitives::{Address, Bytes, keccak256};
use anyhow::{Context, Result};
use futures::{FutureExt, future::BoxFuture};
use serde::{Deserialize, Serialize};

use crate::{ChainClient, Create2Deployment, NetworkId, Salt, address};

/// Output of a step action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployResult {
    pub address: Address,
    /// `false` when the contract was already present and nothing was sent.
    pub freshly_deployed: bool,
    /// Encoded constructor arguments, in order, as needed for source verification.
    #[serde(default)]
    pub constructor_args: Vec<Bytes>,
}

impl DeployResult {
    pub fn fresh(address: Address, constructor_args: Vec<Bytes>) -> Self {
        Self {
            address,
            freshly_deployed: true,
            constructor_args,
        }
    }

    pub fn existing(address: Address, constructor_args: Vec<Bytes>) -> Self {
        Self {
            address,
            freshly_deployed: false,
            constructor_args,
        }
    }

    /// Constructor arguments concatenated as they appear after the creation code.
    pub fn encoded_constructor_args(&self) -> Bytes {
        self.constructor_args
            .iter()
            .flat_map(|arg| arg.iter().copied())
            .collect::<Vec<u8>>()
            .into()
    }
}

/// Everything a step action can see while it runs.
#[derive(Clone)]
pub struct StepContext {
    pub step: String,
    pub network: NetworkId,
    /// The signing account resolved for the run.
    pub deployer: Address,
    /// The CREATE2 factory used to derive and deploy addresses.
    pub factory: Address,
    pub chain: Arc<dyn ChainClient>,
    /// Outputs of the step's dependencies, keyed by step name.
    pub dependencies: BTreeMap<String, DeployResult>,
}

impl StepContext {
    /// The output of dependency `name`.
    pub fn dependency(&self, name: &str) -> Result<&DeployResult> {
        self.dependencies.get(name).with_context(|| {
            format!(
                "Step `{}` has no output for `{}`; is it declared as a dependency?",
                self.step, name
            )
        })
    }

    /// The deployed address of dependency `name`.
    pub fn dependency_address(&self, name: &str) -> Result<Address> {
        self.dependency(name).map(|result| result.address)
    }

    /// Deploy `init_code` at its CREATE2 address unless code is already there.
    ///
    /// The address is derived before anything is sent. If the chain already holds code at
    /// that address the result is returned with `freshly_deployed = false`. After sending,
    /// the code must be present at the derived address, otherwise the deployment mechanism
    /// disagrees with the derivation and the step fails.
    pub async fn deploy_deterministic(
        &self,
        salt: &Salt,
        init_code: Bytes,
        constructor_args: Vec<Bytes>,
    ) -> Result<DeployResult> {
        let init_code_hash = keccak256(&init_code);
        let address = address::derive(salt.as_slice(), init_code_hash, self.factory)?;

        let code = self
            .chain
            .code_at(address)
            .await
            .context(format!("Failed to check code at {}", address))?;

        if !code.is_empty() {
            tracing::info!(
                step = %self.step,
                address = %address,
                "Contract already present at deterministic address, reusing it"
            );
            return Ok(DeployResult::existing(address, constructor_args));
        }

        tracing::info!(
            step = %self.step,
            address = %address,
            salt = %salt,
            init_code_hash = %init_code_hash,
            "Deploying contract"
        );

        let receipt = self
            .chain
            .deploy_create2(Create2Deployment {
                from: self.deployer,
                factory: self.factory,
                salt: *salt,
                init_code,
            })
            .await
            .context("Failed to submit deployment")?;

        anyhow::ensure!(
            receipt.succeeded(),
            "Deployment transaction {} reverted",
            receipt.transaction_hash
        );

        let code = self
            .chain
            .code_at(address)
            .await
            .context(format!("Failed to check code at {}", address))?;

        anyhow::ensure!(
            !code.is_empty(),
            "No code at derived address {} after transaction {}",
            address,
            receipt.transaction_hash
        );

        tracing::info!(
            step = %self.step,
            address = %address,
            tx_hash = %receipt.transaction_hash,
            "Contract deployed"
        );

        Ok(DeployResult::fresh(address, constructor_args))
    }
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("step", &self.step)
            .field("network", &self.network)
            .field("deployer", &self.deployer)
            .field("factory", &self.factory)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// The deploy action of a step.
///
/// Implemented for any `Fn(StepContext) -> impl Future<Output = Result<DeployResult>>`,
/// so closures and `async fn`s can be registered directly.
pub trait StepAction: Send + Sync {
    fn deploy(&self, ctx: StepContext) -> BoxFuture<'static, Result<DeployResult>>;
}

impl<F, Fut> StepAction for F
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<DeployResult>> + Send + 'static,
{
    fn deploy(&self, ctx: StepContext) -> BoxFuture<'static, Result<DeployResult>> {
        self(ctx).boxed()
    }
}

/// A named deployment unit.
///
/// Steps are immutable once built; the registry only hands out shared references.
#[derive(Clone)]
pub struct Step {
    name: String,
    dependencies: BTreeSet<String>,
    action: Arc<dyn StepAction>,
}

impl Step {
    pub fn new(name: impl Into<String>, action: impl StepAction + 'static) -> Self {
        Self {
            name: name.into(),
            dependencies: BTreeSet::new(),
            action: Arc::new(action),
        }
    }

    /// Add a dependency on the step named `name`.
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.insert(name.into());
        self
    }

    /// Add several dependencies at once.
    pub fn with_dependencies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn action(&self) -> &Arc<dyn StepAction> {
        &self.action
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}
