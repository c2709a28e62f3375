//! keel-deploy - Deterministic, dependency-ordered contract deployments.
//!
//! This crate provides the building blocks of a deployment run: CREATE2 address
//! derivation, a per-network deployment ledger, a registry of named steps with their
//! dependencies, best-effort source verification, and the [`Orchestrator`] tying them
//! together.

mod accounts;
pub use accounts::{AccountResolver, DEFAULT_DEPLOYER_ROLE, NamedAccount, NamedAccounts};

pub mod address;
pub use address::{DETERMINISTIC_DEPLOYMENT_PROXY, SALT_LENGTH, Salt};

mod artifact;
pub use artifact::{ArtifactStep, ConstructorArg, ContractArtifact, DEPENDENCY_ARG_PREFIX};

mod chain;
pub use chain::{ChainClient, Create2Deployment, RpcChainClient, RpcError, TxReceipt};

mod config;
pub use config::{
    ENV_PREFIX, ExplorerConfig, KEEL_CONFIG_FILENAME, KeelConfig, NetworkConfig, StepConfig,
    StepVerifyConfig,
};

mod errors;
pub use errors::DeployError;

mod ledger;
pub use ledger::{DeploymentLedger, FileLedger, LedgerEntry, MemoryLedger};

mod network;
pub use network::NetworkId;

mod orchestrator;
pub use orchestrator::{
    DEFAULT_VERIFY_TIMEOUT, ExecutionMode, Orchestrator, RunReport, RunSettings, RunState,
    StepReport, StepStatus, VerificationOutcome, VerificationStatus,
};

mod plan;
pub use plan::{ALL_TAG, ExecutionPlan, StepSelection};

mod registry;
pub use registry::StepRegistry;

mod step;
pub use step::{DeployResult, Step, StepAction, StepContext};

mod verify;
pub use verify::{EtherscanVerifier, SourceMetadata, VerificationError, VerificationRequest, Verifier};
