//! Chain client used by step actions.
//!
//! The orchestrator only needs two things from a chain: whether code exists at an address
//! (the on-chain half of the idempotency check) and a way to submit a CREATE2 deployment.
//! [`RpcChainClient`] implements both over Ethereum JSON-RPC against a node that holds
//! the deployer account unlocked (anvil, hardhat node, or a signing proxy).

use std::time::Duration;

use alloy_core::primitives::{Address, B256, Bytes, U64};
use anyhow::Context;
use backon::{ConstantBuilder, Retryable};
use futures::{FutureExt, future::BoxFuture};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use url::Url;

use crate::Salt;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between `eth_getTransactionReceipt` polls.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Number of receipt polls before giving up on a transaction.
const RECEIPT_POLL_ATTEMPTS: usize = 90;

/// Gas limit attached to deterministic deployment transactions.
const DEPLOY_GAS_LIMIT: u64 = 8_000_000;

/// A CREATE2 deployment routed through a factory contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Create2Deployment {
    /// The signing account.
    pub from: Address,
    /// The CREATE2 factory, i.e. the deployer address used in derivation.
    pub factory: Address,
    pub salt: Salt,
    pub init_code: Bytes,
}

impl Create2Deployment {
    /// Calldata understood by the deterministic deployment proxy: `salt ++ init_code`.
    pub fn calldata(&self) -> Bytes {
        let mut data = Vec::with_capacity(self.salt.as_slice().len() + self.init_code.len());
        data.extend_from_slice(self.salt.as_slice());
        data.extend_from_slice(&self.init_code);
        data.into()
    }
}

/// The subset of a transaction receipt the orchestrator consumes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub transaction_hash: B256,
    /// Set only for plain CREATE transactions; factory deployments leave it empty.
    #[serde(default)]
    pub contract_address: Option<Address>,
    #[serde(default)]
    pub status: Option<U64>,
}

impl TxReceipt {
    /// Whether the transaction executed successfully.
    ///
    /// Pre-Byzantium receipts carry no status and are treated as successful.
    pub fn succeeded(&self) -> bool {
        self.status.is_none_or(|status| status == U64::from(1))
    }
}

/// Error object returned by a JSON-RPC node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, thiserror::Error)]
#[error("RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// JSON-RPC 2.0 response envelope. A `null` result is kept as [`Value::Null`].
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

impl JsonRpcResponse {
    fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Chain access needed by deployment steps.
pub trait ChainClient: Send + Sync {
    /// The chain ID reported by the node.
    fn chain_id(&self) -> BoxFuture<'_, anyhow::Result<u64>>;

    /// The runtime code stored at `address`; empty when nothing is deployed there.
    fn code_at(&self, address: Address) -> BoxFuture<'_, anyhow::Result<Bytes>>;

    /// Submit a CREATE2 deployment and wait for its receipt.
    fn deploy_create2(&self, deployment: Create2Deployment)
    -> BoxFuture<'_, anyhow::Result<TxReceipt>>;
}

/// [`ChainClient`] talking JSON-RPC over HTTP.
#[derive(Debug, Clone)]
pub struct RpcChainClient {
    client: reqwest::Client,
    url: Url,
}

impl RpcChainClient {
    /// Create a client for the node at `url`.
    pub fn new(url: Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Make a JSON-RPC call and deserialize the result.
    ///
    /// Node-side failures surface as [`RpcError`] in the error chain.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> anyhow::Result<T> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let envelope: JsonRpcResponse = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .with_context(|| format!("{method} request to {} failed", self.url))?
            .json()
            .await
            .with_context(|| format!("{method} returned a malformed response"))?;

        let result = envelope
            .into_result()
            .with_context(|| format!("{method} rejected by {}", self.url))?;

        serde_json::from_value(result)
            .with_context(|| format!("{method} returned an unexpected result"))
    }

    async fn fetch_receipt(&self, tx_hash: B256) -> anyhow::Result<TxReceipt> {
        let receipt: Option<TxReceipt> = self
            .call("eth_getTransactionReceipt", vec![serde_json::json!(tx_hash)])
            .await?;

        receipt.with_context(|| format!("Transaction {} is still pending", tx_hash))
    }

    async fn send_and_wait(&self, deployment: Create2Deployment) -> anyhow::Result<TxReceipt> {
        let tx_hash: B256 = self
            .call(
                "eth_sendTransaction",
                vec![serde_json::json!({
                    "from": deployment.from,
                    "to": deployment.factory,
                    "data": deployment.calldata(),
                    "gas": format!("0x{:x}", DEPLOY_GAS_LIMIT),
                })],
            )
            .await
            .context("Failed to send deployment transaction")?;

        tracing::debug!(
            tx_hash = %tx_hash,
            factory = %deployment.factory,
            salt = %deployment.salt,
            "Deployment transaction sent, waiting for receipt"
        );

        let receipt = (|| async { self.fetch_receipt(tx_hash).await })
            .retry(
                ConstantBuilder::default()
                    .with_delay(RECEIPT_POLL_INTERVAL)
                    .with_max_times(RECEIPT_POLL_ATTEMPTS),
            )
            .notify(|err, delay| {
                tracing::trace!(error = %err, ?delay, "Receipt not available yet, retrying...");
            })
            .await
            .with_context(|| format!("Timeout waiting for receipt of {}", tx_hash))?;

        Ok(receipt)
    }
}

impl ChainClient for RpcChainClient {
    fn chain_id(&self) -> BoxFuture<'_, anyhow::Result<u64>> {
        async move {
            let chain_id: U64 = self.call("eth_chainId", vec![]).await?;
            Ok(chain_id.to::<u64>())
        }
        .boxed()
    }

    fn code_at(&self, address: Address) -> BoxFuture<'_, anyhow::Result<Bytes>> {
        async move {
            self.call(
                "eth_getCode",
                vec![serde_json::json!(address), serde_json::json!("latest")],
            )
            .await
        }
        .boxed()
    }

    fn deploy_create2(
        &self,
        deployment: Create2Deployment,
    ) -> BoxFuture<'_, anyhow::Result<TxReceipt>> {
        self.send_and_wait(deployment).boxed()
    }
}
