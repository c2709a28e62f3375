//! Deterministic (CREATE2) contract address derivation.
//!
//! Addresses are computed as `keccak256(0xff ++ deployer ++ salt ++ keccak256(init_code))[12..]`
//! following [EIP-1014](https://eips.ethereum.org/EIPS/eip-1014), so the address of a
//! contract is known before any transaction is sent.

use std::{fmt, str::FromStr};

use alloy_core::primitives::{Address, B256, address, keccak256};
use serde::{Deserialize, Serialize};

use crate::DeployError;

/// The deterministic deployment proxy deployed at the same address on most EVM chains.
///
/// Calling it with `salt ++ init_code` performs a CREATE2 with itself as the deployer.
/// See <https://github.com/Arachnid/deterministic-deployment-proxy>.
pub const DETERMINISTIC_DEPLOYMENT_PROXY: Address =
    address!("4e59b44847b379578588920ca78fbf26c0b4956c");

/// The number of bytes in a CREATE2 salt.
pub const SALT_LENGTH: usize = 32;

/// A 32-byte CREATE2 salt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Salt(B256);

impl Salt {
    /// Parse a hex salt of at most 32 bytes, left-padding it with zeros.
    ///
    /// Short salts such as `0x7061796d61676963` are common in deployment configs; they are
    /// widened the same way the deterministic deployment tooling does.
    pub fn from_hex_padded(value: &str) -> Result<Self, DeployError> {
        let raw = value.trim();
        let digits = raw.strip_prefix("0x").unwrap_or(raw);
        if digits.is_empty() {
            return Err(DeployError::InvalidSalt(format!("`{value}` holds no hex digits")));
        }

        let digits = if digits.len() % 2 == 1 {
            format!("0{digits}")
        } else {
            digits.to_string()
        };

        let bytes = hex::decode(&digits)
            .map_err(|e| DeployError::InvalidSalt(format!("`{value}` is not valid hex: {e}")))?;

        if bytes.len() > SALT_LENGTH {
            return Err(DeployError::InvalidSalt(format!(
                "`{value}` is {} bytes long, at most {SALT_LENGTH} are allowed",
                bytes.len()
            )));
        }

        Ok(Self(B256::left_padding_from(&bytes)))
    }

    pub fn as_b256(&self) -> &B256 {
        &self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl TryFrom<&[u8]> for Salt {
    type Error = DeployError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != SALT_LENGTH {
            return Err(DeployError::InvalidSalt(format!(
                "expected {SALT_LENGTH} bytes, got {}",
                bytes.len()
            )));
        }

        Ok(Self(B256::from_slice(bytes)))
    }
}

impl From<B256> for Salt {
    fn from(value: B256) -> Self {
        Self(value)
    }
}

impl FromStr for Salt {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex_padded(s)
    }
}

impl fmt::Display for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the address a CREATE2 deployment will land at.
///
/// The result depends only on the three inputs. Fails with [`DeployError::InvalidSalt`]
/// unless `salt` is exactly [`SALT_LENGTH`] bytes.
pub fn derive(salt: &[u8], init_code_hash: B256, deployer: Address) -> Result<Address, DeployError> {
    let salt = Salt::try_from(salt)?;
    Ok(derive_with_salt(&salt, init_code_hash, deployer))
}

/// Same as [`derive`] for an already validated salt.
pub fn derive_with_salt(salt: &Salt, init_code_hash: B256, deployer: Address) -> Address {
    deployer.create2(*salt.as_b256(), init_code_hash)
}

/// Convenience wrapper hashing the init code before deriving.
pub fn derive_from_init_code(salt: &Salt, init_code: &[u8], deployer: Address) -> Address {
    derive_with_salt(salt, keccak256(init_code), deployer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eip1014_example_zero() {
        let address = derive(&[0u8; 32], keccak256([0x00]), Address::ZERO).unwrap();
        assert_eq!(
            address,
            address!("4d1a2e2bb4f88f0250f26ffff098b0b30b26bf38"),
        );
    }

    #[test]
    fn test_eip1014_example_deployer() {
        let address = derive(
            &[0u8; 32],
            keccak256([0x00]),
            address!("deadbeef00000000000000000000000000000000"),
        )
        .unwrap();
        assert_eq!(
            address,
            address!("b928f69bb1d91cd65274e3c79d8986362984fda3"),
        );
    }

    #[test]
    fn test_derive_determinism() {
        let salt = [7u8; 32];
        let hash = keccak256(b"init code");

        let first = derive(&salt, hash, DETERMINISTIC_DEPLOYMENT_PROXY).unwrap();
        let second = derive(&salt, hash, DETERMINISTIC_DEPLOYMENT_PROXY).unwrap();

        assert_eq!(first, second, "Derivation should be deterministic");
    }

    #[test]
    fn test_derive_changes_with_each_input() {
        let salt = [7u8; 32];
        let hash = keccak256(b"init code");
        let base = derive(&salt, hash, DETERMINISTIC_DEPLOYMENT_PROXY).unwrap();

        let other_salt = derive(&[8u8; 32], hash, DETERMINISTIC_DEPLOYMENT_PROXY).unwrap();
        let other_code =
            derive(&salt, keccak256(b"other code"), DETERMINISTIC_DEPLOYMENT_PROXY).unwrap();
        let other_deployer = derive(&salt, hash, Address::repeat_byte(0x11)).unwrap();

        assert_ne!(base, other_salt, "Address should change with the salt");
        assert_ne!(base, other_code, "Address should change with the init code hash");
        assert_ne!(base, other_deployer, "Address should change with the deployer");
    }

    #[test]
    fn test_derive_rejects_wrong_salt_length() {
        let hash = keccak256(b"init code");

        for len in [0, 8, 31, 33] {
            let result = derive(&vec![1u8; len], hash, DETERMINISTIC_DEPLOYMENT_PROXY);
            assert!(
                matches!(result, Err(DeployError::InvalidSalt(_))),
                "Salt of {len} bytes should be rejected"
            );
        }
    }

    #[test]
    fn test_salt_from_short_hex_is_left_padded() {
        let salt = Salt::from_hex_padded("0x7061796d61676963").unwrap();
        let bytes = salt.as_slice();

        assert_eq!(bytes.len(), SALT_LENGTH);
        assert!(bytes[..24].iter().all(|b| *b == 0));
        assert_eq!(&bytes[24..], b"paymagic");
    }

    #[test]
    fn test_salt_from_odd_length_hex() {
        let salt: Salt = "0x1".parse().unwrap();
        assert_eq!(salt.as_slice()[31], 1);
    }

    #[test]
    fn test_salt_rejects_empty_hex() {
        for value in ["", "0x", "  "] {
            assert!(
                matches!(Salt::from_hex_padded(value), Err(DeployError::InvalidSalt(_))),
                "`{value}` should be rejected"
            );
        }
        assert_eq!(Salt::from_hex_padded("0x00").unwrap(), Salt::default());
    }

    #[test]
    fn test_salt_rejects_invalid_hex() {
        assert!(matches!(
            Salt::from_hex_padded("0xnothex"),
            Err(DeployError::InvalidSalt(_))
        ));
        let too_long = format!("0x{}", "ab".repeat(33));
        assert!(matches!(
            Salt::from_hex_padded(&too_long),
            Err(DeployError::InvalidSalt(_))
        ));
    }
}
