//! Named account resolution.
//!
//! Steps refer to accounts by role (`deployer`, `owner`, ...). The resolver maps a role to a
//! concrete address for the active network.

use std::collections::BTreeMap;

use alloy_core::primitives::Address;
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::NetworkId;

/// The role used to sign deployments when none is given.
pub const DEFAULT_DEPLOYER_ROLE: &str = "deployer";

/// Maps logical account roles to addresses.
pub trait AccountResolver: Send + Sync {
    /// Resolve `role` on `network`.
    fn resolve(&self, role: &str, network: &NetworkId) -> Result<Address>;
}

/// A single named account: a default address plus per-network overrides.
///
/// ```toml
/// [named_accounts.deployer]
/// default = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
/// sepolia = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedAccount {
    /// Address used when the network has no override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Address>,
    /// Per-network overrides, keyed by network name.
    #[serde(flatten)]
    pub networks: BTreeMap<String, Address>,
}

/// Accounts declared in configuration, keyed by role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamedAccounts(BTreeMap<String, NamedAccount>);

impl NamedAccounts {
    /// Declare `role` with a default address.
    pub fn with_default(mut self, role: impl Into<String>, address: Address) -> Self {
        self.0.entry(role.into()).or_default().default = Some(address);
        self
    }

    /// Override `role` on a specific network.
    pub fn with_network(
        mut self,
        role: impl Into<String>,
        network: impl Into<String>,
        address: Address,
    ) -> Self {
        self.0
            .entry(role.into())
            .or_default()
            .networks
            .insert(network.into(), address);
        self
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl AccountResolver for NamedAccounts {
    fn resolve(&self, role: &str, network: &NetworkId) -> Result<Address> {
        let account = self
            .0
            .get(role)
            .ok_or_else(|| anyhow::anyhow!("No named account declared for role `{}`", role))?;

        account
            .networks
            .get(network.as_str())
            .copied()
            .or(account.default)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Named account `{}` has no address for network `{}` and no default",
                    role,
                    network
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_network_override() {
        let accounts = NamedAccounts::default()
            .with_default("deployer", Address::repeat_byte(1))
            .with_network("deployer", "sepolia", Address::repeat_byte(2));

        assert_eq!(
            accounts.resolve("deployer", &"sepolia".into()).unwrap(),
            Address::repeat_byte(2)
        );
        assert_eq!(
            accounts.resolve("deployer", &"mainnet".into()).unwrap(),
            Address::repeat_byte(1)
        );
    }

    #[test]
    fn test_resolve_unknown_role() {
        let accounts = NamedAccounts::default();
        assert!(accounts.resolve("deployer", &"sepolia".into()).is_err());
    }

    #[test]
    fn test_resolve_without_default() {
        let accounts =
            NamedAccounts::default().with_network("owner", "sepolia", Address::repeat_byte(3));
        assert!(accounts.resolve("owner", &"mainnet".into()).is_err());
    }

    #[test]
    fn test_named_accounts_from_toml() {
        let accounts: NamedAccounts = toml::from_str(
            r#"
            [deployer]
            default = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
            sepolia = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8"
            "#,
        )
        .unwrap();

        let sepolia = accounts.resolve("deployer", &"sepolia".into()).unwrap();
        assert_eq!(
            sepolia,
            "0x70997970C51812dc3A010C7d01b50e0d17dc79C8"
                .parse::<Address>()
                .unwrap()
        );
    }
}
