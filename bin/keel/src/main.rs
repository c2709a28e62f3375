//! keel deploys smart contracts deterministically, in dependency order, exactly once per network.

mod cli;
mod summary;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;

use cli::{AddressArgs, Cli, Command, DeployArgs, SelectionArgs, StatusArgs};
use keel_deploy::{
    AccountResolver, ChainClient, DeploymentLedger, ExecutionPlan, FileLedger, KeelConfig,
    NetworkId, Orchestrator, RpcChainClient, RunSettings, Salt, address,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match &cli.command {
        Command::Address(args) => derive_address(args),
        Command::Plan(args) => plan(&cli.config, args),
        Command::Status(args) => status(&cli.config, args),
        Command::Deploy(args) => deploy(&cli.config, args).await,
    }
}

/// Directory against which relative paths of the configuration are resolved.
fn base_dir(config_path: &Path) -> PathBuf {
    if config_path.is_dir() {
        return config_path.to_path_buf();
    }

    config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn derive_address(args: &AddressArgs) -> Result<()> {
    let salt = Salt::from_hex_padded(&args.salt)?;
    let derived = address::derive_with_salt(&salt, args.init_code_hash, args.deployer);
    println!("{derived}");
    Ok(())
}

fn plan(config_path: &Path, args: &SelectionArgs) -> Result<()> {
    let config = KeelConfig::load_from_file(config_path)?;
    let registry = config.step_registry(&base_dir(config_path))?;

    let plan = ExecutionPlan::build(&registry, &args.selection())?;
    println!("{}", summary::plan_table(&plan));
    Ok(())
}

fn status(config_path: &Path, args: &StatusArgs) -> Result<()> {
    let config = KeelConfig::load_from_file(config_path)?;
    let ledger = FileLedger::new(base_dir(config_path).join(&config.ledger_dir));

    let entries = ledger.entries(&NetworkId::new(args.network.as_str()))?;
    if entries.is_empty() {
        tracing::info!(network = %args.network, "Nothing deployed yet");
        return Ok(());
    }

    println!("{}", summary::ledger_table(&entries));
    Ok(())
}

async fn deploy(config_path: &Path, args: &DeployArgs) -> Result<()> {
    let config = KeelConfig::load_from_file(config_path)?;
    let base_dir = base_dir(config_path);
    let network = NetworkId::new(args.network.as_str());
    let network_config = config.network(&args.network)?;

    let registry = config.step_registry(&base_dir)?;
    let deployer = config
        .named_accounts
        .resolve(&args.deployer, &network)
        .context("Failed to resolve the deployer account")?;

    let chain = RpcChainClient::new(network_config.rpc_url.clone())?;
    if let Some(expected) = network_config.chain_id {
        let actual = chain
            .chain_id()
            .await
            .context(format!("Failed to reach {}", network_config.rpc_url))?;
        anyhow::ensure!(
            actual == expected,
            "Node at {} reports chain ID {}, but network `{}` expects {}",
            network_config.rpc_url,
            actual,
            network,
            expected
        );
    }

    let ledger_dir = base_dir.join(&config.ledger_dir);

    tracing::info!(
        config_path = %config_path.display(),
        ledger_dir = %ledger_dir.display(),
        network = %network,
        rpc_url = %network_config.rpc_url,
        deployer = %deployer,
        "Loading deployment from config file..."
    );

    let settings = RunSettings::new(network.clone(), deployer)
        .with_factory(network_config.factory())
        .with_mode(args.mode(config.concurrent))
        .with_verify_timeout(config.verify_timeout())
        .with_redeploy(args.redeploy);

    let mut orchestrator = Orchestrator::new(
        registry,
        Arc::new(FileLedger::new(ledger_dir)),
        Arc::new(chain),
        settings,
    );

    if !args.no_verify
        && let Some(verifier) = config.verifier(&args.network, &base_dir)?
    {
        orchestrator = orchestrator.with_verifier(Arc::new(verifier));
    }

    let report = orchestrator.run(args.selection.selection()).await;

    if !report.steps.is_empty() {
        println!("{}", summary::run_table(&report));
    }

    report.into_result()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_base_dir() {
        assert_eq!(base_dir(Path::new("Keel.toml")), PathBuf::from("."));
        assert_eq!(
            base_dir(Path::new("project/Keel.toml")),
            PathBuf::from("project")
        );

        let temp_dir = TempDir::new("keel-test").expect("Failed to create temp dir");
        assert_eq!(base_dir(temp_dir.path()), temp_dir.path().to_path_buf());
    }
}
