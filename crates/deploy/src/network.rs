//! Network identifiers.

use derive_more::{Deref, Display, From};
use serde::{Deserialize, Serialize};

/// Name of the network a run targets, e.g. `sepolia` or `localhost`.
///
/// Ledger entries are keyed by network so the same step deployed on two networks
/// never collides.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Deref,
    From,
)]
#[serde(transparent)]
pub struct NetworkId(String);

impl NetworkId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NetworkId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
