//! Durable record of what has been deployed, per network and step.
//!
//! The ledger is consulted before a step runs and written right after it succeeds, so a
//! dependent step never starts before its dependencies' records are persisted.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use alloy_core::primitives::{Address, Bytes};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{DeployResult, NetworkId};

/// Name of the lock file guarding writes to a network directory.
const LOCK_FILENAME: &str = ".lock";

/// Extension of ledger entry files.
const ENTRY_EXTENSION: &str = "json";

/// The last known deployment of a step on one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub step: String,
    pub address: Address,
    /// Whether the run that last wrote this entry actually deployed the contract.
    pub freshly_deployed: bool,
    #[serde(default)]
    pub constructor_args: Vec<Bytes>,
    /// When the contract was first recorded as deployed.
    pub deployed_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Build an entry for a result produced in the current run.
    pub fn from_result(step: impl Into<String>, result: &DeployResult) -> Self {
        Self {
            step: step.into(),
            address: result.address,
            freshly_deployed: result.freshly_deployed,
            constructor_args: result.constructor_args.clone(),
            deployed_at: Utc::now(),
        }
    }

    /// The output a dependent step sees when this entry is reused.
    pub fn to_result(&self) -> DeployResult {
        DeployResult {
            address: self.address,
            freshly_deployed: false,
            constructor_args: self.constructor_args.clone(),
        }
    }

    /// The same record, marked as not deployed by the current run.
    pub fn reused(&self) -> Self {
        Self {
            freshly_deployed: false,
            ..self.clone()
        }
    }
}

/// Persistent mapping from `(network, step)` to the last deployment record.
///
/// `put` overwrites wholesale and must be durable once it returns. Entries are never
/// deleted by the orchestrator.
pub trait DeploymentLedger: Send + Sync {
    /// The record for `step` on `network`, if any.
    fn get(&self, network: &NetworkId, step: &str) -> Result<Option<LedgerEntry>>;

    /// Store `entry` as the record for `step` on `network`.
    fn put(&self, network: &NetworkId, step: &str, entry: &LedgerEntry) -> Result<()>;

    /// Every record stored for `network`, ordered by step name.
    fn entries(&self, network: &NetworkId) -> Result<Vec<LedgerEntry>>;
}

/// In-memory ledger, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<BTreeMap<(NetworkId, String), LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeploymentLedger for MemoryLedger {
    fn get(&self, network: &NetworkId, step: &str) -> Result<Option<LedgerEntry>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Ledger lock poisoned"))?;
        Ok(entries.get(&(network.clone(), step.to_string())).cloned())
    }

    fn put(&self, network: &NetworkId, step: &str, entry: &LedgerEntry) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Ledger lock poisoned"))?;
        entries.insert((network.clone(), step.to_string()), entry.clone());
        Ok(())
    }

    fn entries(&self, network: &NetworkId) -> Result<Vec<LedgerEntry>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Ledger lock poisoned"))?;
        Ok(entries
            .iter()
            .filter(|((entry_network, _), _)| entry_network == network)
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}

/// Ledger stored as one JSON file per step under `{root}/{network}/{step}.json`.
///
/// Writes go to a temporary file that is synced and renamed over the target, under an
/// exclusive lock on `{root}/{network}/.lock`.
#[derive(Debug, Clone)]
pub struct FileLedger {
    root: PathBuf,
}

impl FileLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn network_dir(&self, network: &NetworkId) -> Result<PathBuf> {
        ensure_path_component("network", network.as_str())?;
        Ok(self.root.join(network.as_str()))
    }

    fn entry_path(&self, network: &NetworkId, step: &str) -> Result<PathBuf> {
        ensure_path_component("step", step)?;
        Ok(self
            .network_dir(network)?
            .join(format!("{step}.{ENTRY_EXTENSION}")))
    }

    fn lock(&self, dir: &Path) -> Result<File> {
        let lock_path = dir.join(LOCK_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .context(format!("Failed to open ledger lock {}", lock_path.display()))?;
        file.lock_exclusive()
            .context(format!("Failed to lock {}", lock_path.display()))?;
        Ok(file)
    }

    fn read_entry(path: &Path) -> Result<LedgerEntry> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read ledger entry {}", path.display()))?;
        serde_json::from_str(&content)
            .context(format!("Failed to parse ledger entry {}", path.display()))
    }
}

impl DeploymentLedger for FileLedger {
    fn get(&self, network: &NetworkId, step: &str) -> Result<Option<LedgerEntry>> {
        let path = self.entry_path(network, step)?;
        if !path.exists() {
            return Ok(None);
        }

        Self::read_entry(&path).map(Some)
    }

    fn put(&self, network: &NetworkId, step: &str, entry: &LedgerEntry) -> Result<()> {
        let dir = self.network_dir(network)?;
        fs::create_dir_all(&dir)
            .context(format!("Failed to create ledger directory {}", dir.display()))?;

        let path = self.entry_path(network, step)?;
        let tmp_path = path.with_extension(format!("{ENTRY_EXTENSION}.tmp"));
        let json = serde_json::to_string_pretty(entry).context("Failed to serialize ledger entry")?;

        let lock = self.lock(&dir)?;

        let mut tmp = File::create(&tmp_path)
            .context(format!("Failed to create {}", tmp_path.display()))?;
        tmp.write_all(json.as_bytes())
            .context(format!("Failed to write {}", tmp_path.display()))?;
        tmp.sync_all()
            .context(format!("Failed to sync {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path).context(format!(
            "Failed to move ledger entry into place at {}",
            path.display()
        ))?;

        FileExt::unlock(&lock).context("Failed to release ledger lock")?;

        tracing::debug!(
            network = %network,
            step = %step,
            path = %path.display(),
            "Ledger entry written"
        );

        Ok(())
    }

    fn entries(&self, network: &NetworkId) -> Result<Vec<LedgerEntry>> {
        let dir = self.network_dir(network)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for dir_entry in
            fs::read_dir(&dir).context(format!("Failed to list {}", dir.display()))?
        {
            let path = dir_entry?.path();
            if path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION) {
                entries.push(Self::read_entry(&path)?);
            }
        }

        entries.sort_by(|a, b| a.step.cmp(&b.step));
        Ok(entries)
    }
}

/// Reject names that would escape the ledger directory.
fn ensure_path_component(kind: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && !value.starts_with('.')
        && !value.contains(['/', '\\']);

    anyhow::ensure!(valid, "Invalid {} name for ledger: `{}`", kind, value);
    Ok(())
}
