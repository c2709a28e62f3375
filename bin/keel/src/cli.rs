use std::path::PathBuf;

use alloy_core::primitives::{Address, B256};
use clap::{Args, Parser, Subcommand};
use keel_deploy::{
    DEFAULT_DEPLOYER_ROLE, DETERMINISTIC_DEPLOYMENT_PROXY, ExecutionMode, KEEL_CONFIG_FILENAME,
    StepSelection,
};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "keel")]
#[command(
    author,
    version,
    about = "Deterministic, dependency-ordered smart contract deployments"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "KEEL_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the configuration file, or to the directory containing it.
    #[arg(short, long, alias = "conf", env = "KEEL_CONFIG", default_value = KEEL_CONFIG_FILENAME)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Deploy the selected steps and their dependencies.
    Deploy(DeployArgs),
    /// Print the execution plan without touching the chain.
    Plan(SelectionArgs),
    /// Print the ledger of a network.
    Status(StatusArgs),
    /// Print a CREATE2 address.
    Address(AddressArgs),
}

#[derive(Args)]
pub struct SelectionArgs {
    /// Steps to run, comma separated. Their dependencies are included.
    #[arg(short, long, value_delimiter = ',', env = "KEEL_TAGS", conflicts_with = "all")]
    pub tags: Vec<String>,

    /// Run every registered step.
    #[arg(long, default_value_t = false)]
    pub all: bool,
}

impl SelectionArgs {
    pub fn selection(&self) -> StepSelection {
        if self.all {
            StepSelection::All
        } else {
            StepSelection::from_tags(self.tags.iter().cloned())
        }
    }
}

#[derive(Args)]
pub struct DeployArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// The network to deploy to, as named in the configuration.
    #[arg(short, long, env = "KEEL_NETWORK")]
    pub network: String,

    /// The named account signing the deployments.
    #[arg(long, env = "KEEL_DEPLOYER", default_value = DEFAULT_DEPLOYER_ROLE)]
    pub deployer: String,

    /// Run every step's action even when the ledger records a deployment.
    /// Contracts already present at their deterministic address are still reused.
    #[arg(long, env = "KEEL_REDEPLOY", default_value_t = false)]
    pub redeploy: bool,

    /// Skip source verification.
    #[arg(long, env = "KEEL_NO_VERIFY", default_value_t = false)]
    pub no_verify: bool,

    /// Run independent steps concurrently.
    #[arg(long, env = "KEEL_CONCURRENT", default_value_t = false)]
    pub concurrent: bool,
}

impl DeployArgs {
    /// The scheduling mode, with `concurrent` set either here or in the configuration.
    pub fn mode(&self, configured_concurrent: bool) -> ExecutionMode {
        if self.concurrent || configured_concurrent {
            ExecutionMode::Layered
        } else {
            ExecutionMode::Sequential
        }
    }
}

#[derive(Args)]
pub struct StatusArgs {
    /// The network whose ledger to print.
    #[arg(short, long, env = "KEEL_NETWORK")]
    pub network: String,
}

#[derive(Args)]
pub struct AddressArgs {
    /// The CREATE2 salt, hex, at most 32 bytes.
    #[arg(long)]
    pub salt: String,

    /// keccak256 of the init code.
    #[arg(long)]
    pub init_code_hash: B256,

    /// The deploying contract. Defaults to the deterministic deployment proxy.
    #[arg(long, default_value_t = DETERMINISTIC_DEPLOYMENT_PROXY)]
    pub deployer: Address,
}
