//! Steps built from compiled contract artifacts.
//!
//! An [`ArtifactStep`] deploys the creation code of a Hardhat or Foundry artifact through
//! the CREATE2 factory. Constructor arguments are static 32-byte ABI words; `@Name`
//! arguments are replaced by the address of dependency `Name` at run time.

use std::{path::Path, str::FromStr, sync::Arc};

use alloy_core::primitives::{Address, B256, Bytes, U256};
use anyhow::{Context, Result};
use futures::{FutureExt, future::BoxFuture};
use serde::Deserialize;

use crate::{DeployResult, Salt, StepAction, StepContext};

/// Prefix marking a constructor argument that refers to a dependency's address.
pub const DEPENDENCY_ARG_PREFIX: char = '@';

/// Creation bytecode in either artifact flavour.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BytecodeField {
    /// Hardhat: `"bytecode": "0x..."`.
    Hex(Bytes),
    /// Foundry: `"bytecode": { "object": "0x..." }`.
    Object { object: Bytes },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawArtifact {
    #[serde(default)]
    contract_name: Option<String>,
    bytecode: BytecodeField,
}

/// The parts of a compiled contract needed to deploy it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractArtifact {
    pub contract_name: Option<String>,
    pub bytecode: Bytes,
}

impl ContractArtifact {
    /// Parse an artifact from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawArtifact =
            serde_json::from_str(json).context("Failed to parse contract artifact JSON")?;

        let bytecode = match raw.bytecode {
            BytecodeField::Hex(bytes) | BytecodeField::Object { object: bytes } => bytes,
        };

        anyhow::ensure!(
            !bytecode.is_empty(),
            "Artifact{} has no creation bytecode (abstract contract or interface?)",
            raw.contract_name
                .as_ref()
                .map(|name| format!(" `{name}`"))
                .unwrap_or_default()
        );

        Ok(Self {
            contract_name: raw.contract_name,
            bytecode,
        })
    }

    /// Load an artifact file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read artifact {}", path.display()))?;
        Self::from_json(&content).context(format!("Invalid artifact {}", path.display()))
    }

    /// Creation code followed by the encoded constructor words.
    pub fn init_code(&self, args: &[B256]) -> Bytes {
        let mut code = Vec::with_capacity(self.bytecode.len() + args.len() * 32);
        code.extend_from_slice(&self.bytecode);
        for word in args {
            code.extend_from_slice(word.as_slice());
        }
        code.into()
    }
}

/// One constructor argument as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstructorArg {
    /// `@Name`: the address of dependency `Name`.
    Dependency(String),
    /// A literal, already encoded as a 32-byte word.
    Word(B256),
}

impl ConstructorArg {
    /// The dependency this argument refers to, if any.
    pub fn dependency(&self) -> Option<&str> {
        match self {
            Self::Dependency(name) => Some(name),
            Self::Word(_) => None,
        }
    }

    fn resolve(&self, ctx: &StepContext) -> Result<B256> {
        match self {
            Self::Dependency(name) => Ok(ctx.dependency_address(name)?.into_word()),
            Self::Word(word) => Ok(*word),
        }
    }
}

impl FromStr for ConstructorArg {
    type Err = anyhow::Error;

    /// Accepts `@Name`, a 20-byte hex address, a 32-byte hex word, or a decimal integer.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Some(name) = s.strip_prefix(DEPENDENCY_ARG_PREFIX) {
            anyhow::ensure!(!name.is_empty(), "Empty dependency reference in `{}`", s);
            return Ok(Self::Dependency(name.to_string()));
        }

        if let Some(digits) = s.strip_prefix("0x") {
            return match digits.len() {
                40 => {
                    let address = Address::from_str(s)
                        .context(format!("Invalid address argument `{}`", s))?;
                    Ok(Self::Word(address.into_word()))
                }
                64 => {
                    let word = B256::from_str(s).context(format!("Invalid word argument `{}`", s))?;
                    Ok(Self::Word(word))
                }
                len => anyhow::bail!(
                    "Hex argument `{}` has {} digits, expected 40 (address) or 64 (word)",
                    s,
                    len
                ),
            };
        }

        let value = U256::from_str_radix(s, 10)
            .map_err(|e| anyhow::anyhow!("Invalid integer argument `{}`: {}", s, e))?;
        Ok(Self::Word(B256::from(value.to_be_bytes::<32>())))
    }
}

/// A step that deploys a contract artifact deterministically.
#[derive(Debug, Clone)]
pub struct ArtifactStep {
    artifact: Arc<ContractArtifact>,
    args: Vec<ConstructorArg>,
    salt: Salt,
}

impl ArtifactStep {
    pub fn new(artifact: ContractArtifact, args: Vec<ConstructorArg>, salt: Salt) -> Self {
        Self {
            artifact: Arc::new(artifact),
            args,
            salt,
        }
    }

    pub fn artifact(&self) -> &ContractArtifact {
        &self.artifact
    }

    pub fn args(&self) -> &[ConstructorArg] {
        &self.args
    }

    /// Dependencies referenced by `@Name` arguments.
    pub fn referenced_dependencies(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(ConstructorArg::dependency)
    }

    async fn run(self, ctx: StepContext) -> Result<DeployResult> {
        let words = self
            .args
            .iter()
            .map(|arg| arg.resolve(&ctx))
            .collect::<Result<Vec<_>>>()?;

        let init_code = self.artifact.init_code(&words);
        let constructor_args = words
            .iter()
            .map(|word| Bytes::copy_from_slice(word.as_slice()))
            .collect();

        ctx.deploy_deterministic(&self.salt, init_code, constructor_args)
            .await
    }
}

impl StepAction for ArtifactStep {
    fn deploy(&self, ctx: StepContext) -> BoxFuture<'static, Result<DeployResult>> {
        self.clone().run(ctx).boxed()
    }
}
