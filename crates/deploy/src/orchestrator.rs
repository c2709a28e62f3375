//! The deployment orchestrator.
//!
//! A run moves through [`RunState::Planning`], [`RunState::Executing`] and ends in either
//! [`RunState::Completed`] or [`RunState::Failed`]. Planning (closure expansion, ordering,
//! cycle detection) finishes before any step executes. During execution each step is
//! skipped if the ledger knows its address and the chain holds code there, otherwise its
//! action runs and the result is persisted before any dependent step starts.
//!
//! A failing step stops the run. Steps that already completed keep their ledger entries
//! and are skipped by the next run. Source verification of freshly deployed steps runs in
//! the background and its outcome never changes the run's state.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use alloy_core::primitives::Address;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{
    ChainClient, DETERMINISTIC_DEPLOYMENT_PROXY, DeployError, DeployResult, DeploymentLedger,
    ExecutionPlan, LedgerEntry, NetworkId, StepContext, StepRegistry, StepSelection,
    VerificationError, VerificationRequest, Verifier,
};

/// Default upper bound on a single verification.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle of a run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
pub enum RunState {
    Planning,
    Executing,
    Completed,
    Failed,
}

/// How the steps of a plan are scheduled.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ExecutionMode {
    /// One step at a time, in plan order.
    #[default]
    Sequential,
    /// Steps of the same plan layer run concurrently.
    Layered,
}

/// Parameters of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub network: NetworkId,
    pub deployer: Address,
    pub factory: Address,
    pub mode: ExecutionMode,
    pub verify_timeout: Duration,
    /// Ignore ledger entries and run every step's action.
    pub redeploy: bool,
}

impl RunSettings {
    pub fn new(network: impl Into<NetworkId>, deployer: Address) -> Self {
        Self {
            network: network.into(),
            deployer,
            factory: DETERMINISTIC_DEPLOYMENT_PROXY,
            mode: ExecutionMode::default(),
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            redeploy: false,
        }
    }

    pub fn with_factory(mut self, factory: Address) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    pub fn with_redeploy(mut self, redeploy: bool) -> Self {
        self.redeploy = redeploy;
        self
    }
}

/// What happened to one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// The contract was already deployed; nothing was sent.
    SkippedAlreadyDeployed,
    FreshlyDeployed,
    /// The action or the ledger failed; holds the error message.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub status: StepStatus,
    pub result: Option<DeployResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationStatus {
    Verified,
    Failed(VerificationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub step: String,
    pub address: Address,
    pub status: VerificationStatus,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct RunReport {
    pub network: NetworkId,
    pub state: RunState,
    /// `None` when planning failed.
    pub plan: Option<ExecutionPlan>,
    /// One entry per attempted step, in plan order.
    pub steps: Vec<StepReport>,
    pub verifications: Vec<VerificationOutcome>,
    /// The error that failed the run.
    pub error: Option<DeployError>,
}

impl RunReport {
    fn planning_failed(network: NetworkId, error: DeployError) -> Self {
        Self {
            network,
            state: RunState::Failed,
            plan: None,
            steps: Vec::new(),
            verifications: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Results of the steps that succeeded, in plan order.
    pub fn results(&self) -> impl Iterator<Item = (&str, &DeployResult)> {
        self.steps
            .iter()
            .filter_map(|report| report.result.as_ref().map(|r| (report.name.as_str(), r)))
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|report| report.name == name)
    }

    /// Address of `name` if it succeeded in this run.
    pub fn address(&self, name: &str) -> Option<Address> {
        self.step(name)
            .and_then(|report| report.result.as_ref())
            .map(|result| result.address)
    }

    /// Steps skipped because they were already deployed.
    pub fn skipped(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .filter(|report| report.status == StepStatus::SkippedAlreadyDeployed)
            .map(|report| report.name.as_str())
    }

    /// The results keyed by step name, or the error that failed the run.
    pub fn into_result(self) -> Result<BTreeMap<String, DeployResult>, DeployError> {
        if let Some(error) = self.error {
            return Err(error);
        }

        Ok(self
            .steps
            .into_iter()
            .filter_map(|report| report.result.map(|result| (report.name, result)))
            .collect())
    }
}

/// Outcome of one step inside a run.
struct StepOutcome {
    status: StepStatus,
    result: DeployResult,
}

/// A verification running in the background.
struct PendingVerification {
    step: String,
    address: Address,
    handle: JoinHandle<Result<(), VerificationError>>,
}

/// Plans and executes deployment runs against one network.
pub struct Orchestrator {
    registry: StepRegistry,
    ledger: Arc<dyn DeploymentLedger>,
    chain: Arc<dyn ChainClient>,
    verifier: Option<Arc<dyn Verifier>>,
    settings: RunSettings,
}

impl Orchestrator {
    pub fn new(
        registry: StepRegistry,
        ledger: Arc<dyn DeploymentLedger>,
        chain: Arc<dyn ChainClient>,
        settings: RunSettings,
    ) -> Self {
        Self {
            registry,
            ledger,
            chain,
            verifier: None,
            settings,
        }
    }

    /// Verify freshly deployed steps with `verifier`.
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Plan `selection` without executing anything.
    pub fn plan(&self, selection: &StepSelection) -> Result<ExecutionPlan, DeployError> {
        ExecutionPlan::build(&self.registry, selection)
    }

    /// Plan and execute `selection`.
    ///
    /// Never panics on step failure; inspect [`RunReport::state`] and [`RunReport::error`].
    pub async fn run(&self, selection: StepSelection) -> RunReport {
        let network = self.settings.network.clone();

        tracing::info!(network = %network, state = %RunState::Planning, "Planning deployment");

        let plan = match self.plan(&selection) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::error!(
                    network = %network,
                    state = %RunState::Failed,
                    error = %err,
                    "Planning failed, no step was executed"
                );
                return RunReport::planning_failed(network, err);
            }
        };

        tracing::info!(
            network = %network,
            state = %RunState::Executing,
            mode = %self.settings.mode,
            steps = ?plan.order,
            "Executing deployment plan"
        );

        let batches: Vec<Vec<String>> = match self.settings.mode {
            ExecutionMode::Sequential => plan.order.iter().map(|name| vec![name.clone()]).collect(),
            ExecutionMode::Layered => plan.layers.clone(),
        };

        let mut outputs: BTreeMap<String, DeployResult> = BTreeMap::new();
        let mut steps: Vec<StepReport> = Vec::with_capacity(plan.len());
        let mut pending: Vec<PendingVerification> = Vec::new();
        let mut error: Option<DeployError> = None;

        for batch in batches {
            let outcomes = join_all(batch.iter().map(|name| self.execute_step(name, &outputs))).await;

            for (name, outcome) in batch.into_iter().zip(outcomes) {
                match outcome {
                    Ok(StepOutcome { status, result }) => {
                        if status == StepStatus::FreshlyDeployed {
                            pending.extend(self.spawn_verification(&name, &result));
                        }
                        outputs.insert(name.clone(), result.clone());
                        steps.push(StepReport {
                            name,
                            status,
                            result: Some(result),
                        });
                    }
                    Err(err) => {
                        tracing::error!(network = %network, step = %name, error = %err, "Step failed");
                        steps.push(StepReport {
                            name,
                            status: StepStatus::Failed(err.to_string()),
                            result: None,
                        });
                        error.get_or_insert(err);
                    }
                }
            }

            if error.is_some() {
                break;
            }
        }

        let verifications = collect_verifications(pending).await;

        let state = if error.is_some() {
            RunState::Failed
        } else {
            RunState::Completed
        };

        match &error {
            None => tracing::info!(
                network = %network,
                state = %state,
                steps = steps.len(),
                "Deployment completed"
            ),
            Some(err) => tracing::error!(
                network = %network,
                state = %state,
                completed = steps.iter().filter(|s| s.result.is_some()).count(),
                error = %err,
                "Deployment failed"
            ),
        }

        RunReport {
            network,
            state,
            plan: Some(plan),
            steps,
            verifications,
            error,
        }
    }

    /// Skip or execute a single step and record its result.
    async fn execute_step(
        &self,
        name: &str,
        outputs: &BTreeMap<String, DeployResult>,
    ) -> Result<StepOutcome, DeployError> {
        let network = &self.settings.network;
        let step = self.registry.resolve(name)?;

        if !self.settings.redeploy
            && let Some(entry) = self
                .ledger
                .get(network, name)
                .map_err(|e| DeployError::ledger(name, e))?
        {
            let code = self
                .chain
                .code_at(entry.address)
                .await
                .map_err(|e| DeployError::step_failed(name, e))?;

            if !code.is_empty() {
                tracing::info!(
                    network = %network,
                    step = %name,
                    address = %entry.address,
                    "Already deployed, skipping"
                );
                self.ledger
                    .put(network, name, &entry.reused())
                    .map_err(|e| DeployError::ledger(name, e))?;
                return Ok(StepOutcome {
                    status: StepStatus::SkippedAlreadyDeployed,
                    result: entry.to_result(),
                });
            }

            tracing::warn!(
                network = %network,
                step = %name,
                address = %entry.address,
                "Ledger entry has no code on chain, redeploying"
            );
        }

        let dependencies = step
            .dependencies()
            .iter()
            .filter_map(|dep| outputs.get(dep).map(|result| (dep.clone(), result.clone())))
            .collect();

        let ctx = StepContext {
            step: name.to_string(),
            network: network.clone(),
            deployer: self.settings.deployer,
            factory: self.settings.factory,
            chain: Arc::clone(&self.chain),
            dependencies,
        };

        tracing::debug!(network = %network, step = %name, "Executing step");

        let result = step
            .action()
            .deploy(ctx)
            .await
            .map_err(|e| DeployError::step_failed(name, e))?;

        self.ledger
            .put(network, name, &LedgerEntry::from_result(name, &result))
            .map_err(|e| DeployError::ledger(name, e))?;

        let status = if result.freshly_deployed {
            StepStatus::FreshlyDeployed
        } else {
            StepStatus::SkippedAlreadyDeployed
        };

        tracing::info!(
            network = %network,
            step = %name,
            address = %result.address,
            fresh = result.freshly_deployed,
            "Step completed"
        );

        Ok(StepOutcome { status, result })
    }

    fn spawn_verification(&self, step: &str, result: &DeployResult) -> Option<PendingVerification> {
        let verifier = Arc::clone(self.verifier.as_ref()?);
        let timeout = self.settings.verify_timeout;
        let request = VerificationRequest {
            step: step.to_string(),
            address: result.address,
            constructor_args: result.constructor_args.clone(),
        };

        tracing::debug!(step = %step, address = %result.address, "Starting source verification");

        let handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, verifier.verify(&request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(VerificationError::Timeout(timeout)),
            }
        });

        Some(PendingVerification {
            step: step.to_string(),
            address: result.address,
            handle,
        })
    }
}

async fn collect_verifications(pending: Vec<PendingVerification>) -> Vec<VerificationOutcome> {
    let mut outcomes = Vec::with_capacity(pending.len());

    for PendingVerification {
        step,
        address,
        handle,
    } in pending
    {
        let status = match handle.await {
            Ok(Ok(())) => {
                tracing::info!(step = %step, address = %address, "Source verified");
                VerificationStatus::Verified
            }
            Ok(Err(err)) => {
                tracing::warn!(step = %step, address = %address, error = %err, "Verification failed");
                VerificationStatus::Failed(err)
            }
            Err(join_err) => {
                tracing::warn!(step = %step, address = %address, error = %join_err, "Verification task aborted");
                VerificationStatus::Failed(VerificationError::Aborted(join_err.to_string()))
            }
        };

        outcomes.push(VerificationOutcome {
            step,
            address,
            status,
        });
    }

    outcomes
}

#[cfg(test)]
mod tests {
    use alloy_core::primitives::Bytes;
    use futures::{FutureExt, future::BoxFuture};

    use super::*;
    use crate::{Create2Deployment, MemoryLedger, Step, TxReceipt};

    /// Chain that holds code nowhere and refuses every deployment.
    struct EmptyChain;

    impl ChainClient for EmptyChain {
        fn chain_id(&self) -> BoxFuture<'_, anyhow::Result<u64>> {
            async { Ok(31337) }.boxed()
        }

        fn code_at(&self, _address: Address) -> BoxFuture<'_, anyhow::Result<Bytes>> {
            async { Ok(Bytes::new()) }.boxed()
        }

        fn deploy_create2(
            &self,
            _deployment: Create2Deployment,
        ) -> BoxFuture<'_, anyhow::Result<TxReceipt>> {
            async { anyhow::bail!("deployments are disabled") }.boxed()
        }
    }

    fn orchestrator(registry: StepRegistry) -> Orchestrator {
        Orchestrator::new(
            registry,
            Arc::new(MemoryLedger::new()),
            Arc::new(EmptyChain),
            RunSettings::new("localhost", Address::repeat_byte(0xde)),
        )
    }

    #[test]
    fn test_run_settings_defaults() {
        let settings = RunSettings::new("localhost", Address::ZERO);
        assert_eq!(settings.factory, DETERMINISTIC_DEPLOYMENT_PROXY);
        assert_eq!(settings.mode, ExecutionMode::Sequential);
        assert_eq!(settings.verify_timeout, DEFAULT_VERIFY_TIMEOUT);
        assert!(!settings.redeploy);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(RunState::Completed.to_string(), "completed");
        assert_eq!("layered".parse::<ExecutionMode>().unwrap(), ExecutionMode::Layered);
    }

    #[tokio::test]
    async fn test_unknown_selection_fails_planning() {
        let orchestrator = orchestrator(StepRegistry::new());

        let report = orchestrator
            .run(StepSelection::Tags(vec!["Wallet".to_string()]))
            .await;

        assert_eq!(report.state, RunState::Failed);
        assert!(report.plan.is_none());
        assert!(report.steps.is_empty());
        assert!(report.error.as_ref().is_some_and(DeployError::is_planning_error));
    }

    #[tokio::test]
    async fn test_action_error_is_wrapped() {
        let mut registry = StepRegistry::new();
        registry
            .register(Step::new("Wallet", |_ctx: StepContext| async {
                Err::<DeployResult, _>(anyhow::anyhow!("constructor reverted"))
            }))
            .unwrap();

        let report = orchestrator(registry).run(StepSelection::All).await;

        assert_eq!(report.state, RunState::Failed);
        assert!(matches!(
            report.step("Wallet").map(|s| &s.status),
            Some(StepStatus::Failed(_))
        ));
        match report.into_result() {
            Err(DeployError::StepExecutionFailed { step, cause }) => {
                assert_eq!(step, "Wallet");
                assert_eq!(cause.to_string(), "constructor reverted");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dependency_outputs_reach_dependents() {
        let wallet = Address::repeat_byte(0x11);

        let mut registry = StepRegistry::new();
        registry
            .register(Step::new("Wallet", move |_ctx: StepContext| async move {
                anyhow::Ok(DeployResult::fresh(wallet, vec![]))
            }))
            .unwrap();
        registry
            .register(
                Step::new("WalletFactory", |ctx: StepContext| async move {
                    let wallet = ctx.dependency_address("Wallet")?;
                    anyhow::Ok(DeployResult::fresh(
                        Address::repeat_byte(0x22),
                        vec![Bytes::copy_from_slice(wallet.into_word().as_slice())],
                    ))
                })
                .depends_on("Wallet"),
            )
            .unwrap();

        let report = orchestrator(registry).run(StepSelection::All).await;

        assert!(report.is_completed());
        let factory = report.step("WalletFactory").unwrap().result.as_ref().unwrap();
        assert_eq!(&factory.constructor_args[0][12..], wallet.as_slice());
        assert!(report.verifications.is_empty());
    }
}
