//! Project configuration (`Keel.toml`).
//!
//! Configuration is read with figment: the TOML file first, then `KEEL_`-prefixed
//! environment variables (nested keys separated by `__`), so secrets such as explorer API
//! keys can stay out of the file:
//!
//! ```text
//! KEEL_NETWORKS__SEPOLIA__EXPLORER__API_KEY=...
//! ```

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    ArtifactStep, ConstructorArg, ContractArtifact, DETERMINISTIC_DEPLOYMENT_PROXY,
    EtherscanVerifier, NamedAccounts, Salt, SourceMetadata, Step, StepRegistry,
};

/// The default name of the configuration file.
pub const KEEL_CONFIG_FILENAME: &str = "Keel.toml";

/// Prefix of environment variables overriding configuration values.
pub const ENV_PREFIX: &str = "KEEL_";

/// `KEEL_*` variables read by the command line rather than the configuration.
///
/// `concurrent` is listed because the CLI accepts values such as `1` for it; the CLI
/// flag and the configuration value are combined by the binary.
pub const CLI_ENV_KEYS: &[&str] = &[
    "config",
    "verbosity",
    "network",
    "tags",
    "deployer",
    "redeploy",
    "no_verify",
    "concurrent",
];

fn default_ledger_dir() -> PathBuf {
    PathBuf::from("deployments")
}

fn default_verify_timeout_secs() -> u64 {
    60
}

/// Explorer endpoint used to verify sources on a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerConfig {
    pub api_url: Url,
    #[serde(default)]
    pub api_key: String,
}

/// Connection settings for one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub rpc_url: Url,
    /// Expected chain ID; checked against the node before deploying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    /// CREATE2 factory override; defaults to the deterministic deployment proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explorer: Option<ExplorerConfig>,
}

impl NetworkConfig {
    pub fn factory(&self) -> Address {
        self.factory.unwrap_or(DETERMINISTIC_DEPLOYMENT_PROXY)
    }
}

/// Source verification settings of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepVerifyConfig {
    /// Fully qualified contract name, e.g. `contracts/Wallet.sol:Wallet`.
    pub contract: String,
    pub compiler_version: String,
    /// Path to the standard JSON input, relative to the config file.
    pub source: PathBuf,
}

/// One artifact-driven step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Path to the compiled artifact, relative to the config file.
    pub artifact: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Constructor arguments; see [`ConstructorArg`] for the accepted forms.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// CREATE2 salt, hex, at most 32 bytes. Defaults to zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<StepVerifyConfig>,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeelConfig {
    /// Ledger directory, relative to the config file.
    #[serde(default = "default_ledger_dir")]
    pub ledger_dir: PathBuf,
    /// Upper bound on a single verification attempt.
    #[serde(default = "default_verify_timeout_secs")]
    pub verify_timeout_secs: u64,
    /// Run mutually independent steps concurrently.
    #[serde(default)]
    pub concurrent: bool,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(default)]
    pub named_accounts: NamedAccounts,
    #[serde(default)]
    pub steps: BTreeMap<String, StepConfig>,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            ledger_dir: default_ledger_dir(),
            verify_timeout_secs: default_verify_timeout_secs(),
            concurrent: false,
            networks: BTreeMap::new(),
            named_accounts: NamedAccounts::default(),
            steps: BTreeMap::new(),
        }
    }
}

impl KeelConfig {
    /// Load the configuration from a file (or a directory holding [`KEEL_CONFIG_FILENAME`]),
    /// merged with `KEEL_` environment variables.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!(
                "Configuration file or directory not found: {}",
                path.display()
            );
        }

        let config_path = if path.is_dir() {
            path.join(KEEL_CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        anyhow::ensure!(
            config_path.is_file(),
            "Configuration file not found: {}",
            config_path.display()
        );

        let config: Self = Self::figment(Toml::file(&config_path))
            .extract()
            .context(format!("Failed to load config from {}", config_path.display()))?;

        tracing::info!(path = %config_path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Parse configuration from a TOML string, merged with the environment.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::figment(Toml::string(content))
            .extract()
            .context("Failed to parse config")
    }

    fn figment(toml: figment::providers::Data<Toml>) -> Figment {
        Figment::new()
            .merge(toml)
            .merge(Env::prefixed(ENV_PREFIX).ignore(CLI_ENV_KEYS).split("__"))
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        std::fs::write(path, content)
            .context(format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    /// Settings of network `name`.
    pub fn network(&self, name: &str) -> Result<&NetworkConfig> {
        self.networks.get(name).with_context(|| {
            format!(
                "Network `{}` is not configured (known: {})",
                name,
                self.networks.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }

    /// Build the step registry from the `[steps]` table.
    ///
    /// Relative artifact paths are resolved against `base_dir`. Every `@Name` constructor
    /// argument must name a declared dependency of the same step.
    pub fn step_registry(&self, base_dir: &Path) -> Result<StepRegistry> {
        let mut registry = StepRegistry::new();

        for (name, step_config) in &self.steps {
            let artifact = ContractArtifact::load(&base_dir.join(&step_config.artifact))
                .context(format!("Failed to load artifact for step `{}`", name))?;

            let args = step_config
                .args
                .iter()
                .map(|arg| arg.parse::<ConstructorArg>())
                .collect::<Result<Vec<_>>>()
                .context(format!("Invalid constructor arguments for step `{}`", name))?;

            let salt = step_config
                .salt
                .as_deref()
                .map(Salt::from_hex_padded)
                .transpose()?
                .unwrap_or_default();

            let action = ArtifactStep::new(artifact, args, salt);

            for dep in action.referenced_dependencies() {
                anyhow::ensure!(
                    step_config.dependencies.iter().any(|d| d == dep),
                    "Step `{}` uses `@{}` as a constructor argument but does not depend on it",
                    name,
                    dep
                );
            }

            registry.register(
                Step::new(name.clone(), action).with_dependencies(step_config.dependencies.clone()),
            )?;
        }

        Ok(registry)
    }

    /// Build the explorer verifier for `network`, if it has an explorer configured.
    pub fn verifier(&self, network: &str, base_dir: &Path) -> Result<Option<EtherscanVerifier>> {
        let Some(explorer) = &self.network(network)?.explorer else {
            return Ok(None);
        };

        let mut verifier = EtherscanVerifier::new(explorer.api_url.clone(), &explorer.api_key)?;

        for (name, step_config) in &self.steps {
            let Some(verify) = &step_config.verify else {
                continue;
            };

            let source_path = base_dir.join(&verify.source);
            let source_code = std::fs::read_to_string(&source_path).context(format!(
                "Failed to read verification input {}",
                source_path.display()
            ))?;

            verifier = verifier.with_source(
                name.clone(),
                SourceMetadata {
                    contract_name: verify.contract.clone(),
                    compiler_version: verify.compiler_version.clone(),
                    source_code,
                },
            );
        }

        Ok(Some(verifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccountResolver, DeployError};
    use tempdir::TempDir;

    const CONFIG: &str = r#"
        ledger_dir = "state"

        [networks.localhost]
        rpc_url = "http://127.0.0.1:8545"
        chain_id = 31337

        [networks.sepolia]
        rpc_url = "https://ethereum-sepolia-rpc.publicnode.com"
        explorer = { api_url = "https://api-sepolia.etherscan.io/api", api_key = "secret" }

        [named_accounts.deployer]
        default = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"

        [steps.Wallet]
        artifact = "artifacts/Wallet.json"
        salt = "0x7061796d61676963"

        [steps.WalletFactory]
        artifact = "artifacts/WalletFactory.json"
        dependencies = ["Wallet"]
        args = ["@Wallet"]
        salt = "0x7061796d61676963"
    "#;

    fn write_artifacts(dir: &Path) {
        let artifacts = dir.join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();
        std::fs::write(
            artifacts.join("Wallet.json"),
            r#"{ "contractName": "Wallet", "bytecode": "0x6080" }"#,
        )
        .unwrap();
        std::fs::write(
            artifacts.join("WalletFactory.json"),
            r#"{ "contractName": "WalletFactory", "bytecode": "0x6081" }"#,
        )
        .unwrap();
    }

    #[test]
    fn test_parse_config() {
        let config = KeelConfig::from_toml_str(CONFIG).unwrap();

        assert_eq!(config.ledger_dir, PathBuf::from("state"));
        assert_eq!(config.verify_timeout(), Duration::from_secs(60));
        assert!(!config.concurrent);

        let localhost = config.network("localhost").unwrap();
        assert_eq!(localhost.chain_id, Some(31337));
        assert_eq!(localhost.factory(), DETERMINISTIC_DEPLOYMENT_PROXY);

        let sepolia = config.network("sepolia").unwrap();
        assert_eq!(sepolia.explorer.as_ref().unwrap().api_key, "secret");

        assert!(config.network("mainnet").is_err());
        assert!(
            config
                .named_accounts
                .resolve("deployer", &"localhost".into())
                .is_ok()
        );
    }

    #[test]
    fn test_step_registry_from_config() {
        let temp_dir = TempDir::new("keel-test").expect("Failed to create temp dir");
        write_artifacts(temp_dir.path());

        let config = KeelConfig::from_toml_str(CONFIG).unwrap();
        let registry = config.step_registry(temp_dir.path()).unwrap();

        assert_eq!(registry.len(), 2);
        let factory = registry.resolve("WalletFactory").unwrap();
        assert!(factory.dependencies().contains("Wallet"));
    }

    #[test]
    fn test_step_registry_rejects_undeclared_reference() {
        let temp_dir = TempDir::new("keel-test").expect("Failed to create temp dir");
        write_artifacts(temp_dir.path());

        let mut config = KeelConfig::from_toml_str(CONFIG).unwrap();
        config
            .steps
            .get_mut("WalletFactory")
            .unwrap()
            .dependencies
            .clear();

        assert!(config.step_registry(temp_dir.path()).is_err());
    }

    #[test]
    fn test_step_registry_rejects_invalid_salt() {
        let temp_dir = TempDir::new("keel-test").expect("Failed to create temp dir");
        write_artifacts(temp_dir.path());

        let mut config = KeelConfig::from_toml_str(CONFIG).unwrap();
        config.steps.get_mut("Wallet").unwrap().salt = Some("0xzz".to_string());

        let err = config.step_registry(temp_dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::InvalidSalt(_))
        ));
    }

    #[test]
    fn test_verifier_only_for_networks_with_explorer() {
        let temp_dir = TempDir::new("keel-test").expect("Failed to create temp dir");
        let config = KeelConfig::from_toml_str(CONFIG).unwrap();

        assert!(config.verifier("localhost", temp_dir.path()).unwrap().is_none());
        assert!(config.verifier("sepolia", temp_dir.path()).unwrap().is_some());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = TempDir::new("keel-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join(KEEL_CONFIG_FILENAME);

        let original = KeelConfig::from_toml_str(CONFIG).unwrap();
        original.save_to_file(&path).unwrap();

        let loaded = KeelConfig::load_from_file(temp_dir.path()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_cli_variables_do_not_reach_config() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("KEEL_CONCURRENT", "1");
            jail.set_env("KEEL_NETWORK", "sepolia");
            jail.set_env("KEEL_VERBOSITY", "debug");
            jail.set_env("KEEL_NO_VERIFY", "true");

            let config = KeelConfig::from_toml_str(CONFIG).expect("CLI variables break config");
            assert!(!config.concurrent);
            assert_eq!(config.networks.len(), 2);
            Ok(())
        });
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new("keel-test").expect("Failed to create temp dir");
        assert!(KeelConfig::load_from_file(&temp_dir.path().join("missing.toml")).is_err());
    }
}
