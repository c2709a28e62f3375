//! Best-effort source verification against a block explorer.
//!
//! Verification never decides whether a deployment succeeded. Every failure is returned as
//! a [`VerificationError`] which the orchestrator records and logs.

use std::{collections::BTreeMap, time::Duration};

use alloy_core::primitives::{Address, Bytes};
use backon::{ConstantBuilder, Retryable};
use futures::{FutureExt, future::BoxFuture};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Default timeout for explorer HTTP requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval between `checkverifystatus` polls.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Number of status polls before giving up.
const STATUS_POLL_ATTEMPTS: usize = 10;

/// Non-fatal verification failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rejected by explorer: {0}")]
    Rejected(String),
    #[error("contract is already verified")]
    AlreadyVerified,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("no source metadata configured for step `{0}`")]
    MissingSource(String),
    #[error("verification task aborted: {0}")]
    Aborted(String),
}

/// What is submitted for a freshly deployed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub step: String,
    pub address: Address,
    pub constructor_args: Vec<Bytes>,
}

impl VerificationRequest {
    /// Hex of the constructor arguments without `0x`, as explorers expect it.
    pub fn encoded_constructor_args(&self) -> String {
        self.constructor_args.iter().map(hex::encode).collect()
    }
}

/// Registers deployed source code with an external service.
pub trait Verifier: Send + Sync {
    fn verify<'a>(
        &'a self,
        request: &'a VerificationRequest,
    ) -> BoxFuture<'a, Result<(), VerificationError>>;
}

/// Compiler input needed to verify one contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Fully qualified name, e.g. `contracts/Wallet.sol:Wallet`.
    pub contract_name: String,
    /// Full compiler version, e.g. `v0.8.19+commit.7dd6d404`.
    pub compiler_version: String,
    /// Standard JSON input passed to the compiler.
    pub source_code: String,
}

/// Explorer reply envelope shared by every Etherscan-style endpoint.
#[derive(Debug, Clone, Deserialize)]
struct ExplorerResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: String,
}

/// Interpretation of an explorer reply.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ExplorerReply {
    /// Submission accepted; the payload is the GUID to poll.
    Submitted(String),
    Verified,
    Pending,
    Failed(VerificationError),
}

impl ExplorerResponse {
    fn already_verified(&self) -> bool {
        format!("{} {}", self.message, self.result)
            .to_lowercase()
            .contains("already verified")
    }

    fn rejection(&self) -> ExplorerReply {
        let reason = if self.result.is_empty() {
            self.message.clone()
        } else {
            self.result.clone()
        };
        ExplorerReply::Failed(VerificationError::Rejected(reason))
    }

    /// Interpret the reply to `verifysourcecode`; a successful reply carries the GUID.
    fn classify_submission(&self) -> ExplorerReply {
        if self.already_verified() {
            return ExplorerReply::Failed(VerificationError::AlreadyVerified);
        }
        if self.status == "1" && !self.result.is_empty() {
            return ExplorerReply::Submitted(self.result.clone());
        }
        self.rejection()
    }

    /// Interpret the reply to `checkverifystatus`.
    fn classify_status(&self) -> ExplorerReply {
        if self.result.starts_with("Pass") {
            return ExplorerReply::Verified;
        }
        if self.already_verified() {
            return ExplorerReply::Failed(VerificationError::AlreadyVerified);
        }

        let result = self.result.to_lowercase();
        if result.contains("pending") || result.contains("in queue") {
            return ExplorerReply::Pending;
        }
        self.rejection()
    }
}

/// [`Verifier`] for Etherscan-compatible APIs (Etherscan, Blockscout, Arbiscan, ...).
#[derive(Debug, Clone)]
pub struct EtherscanVerifier {
    client: reqwest::Client,
    api_url: Url,
    api_key: String,
    sources: BTreeMap<String, SourceMetadata>,
}

impl EtherscanVerifier {
    pub fn new(api_url: Url, api_key: impl Into<String>) -> Result<Self, VerificationError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| VerificationError::Network(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            api_key: api_key.into(),
            sources: BTreeMap::new(),
        })
    }

    /// Register the source metadata used to verify `step`.
    pub fn with_source(mut self, step: impl Into<String>, source: SourceMetadata) -> Self {
        self.sources.insert(step.into(), source);
        self
    }

    async fn post(&self, form: &[(&str, &str)]) -> Result<ExplorerResponse, VerificationError> {
        let response = self
            .client
            .post(self.api_url.clone())
            .form(form)
            .send()
            .await
            .map_err(|e| VerificationError::Network(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| VerificationError::Network(format!("invalid explorer response: {e}")))
    }

    async fn submit(&self, request: &VerificationRequest) -> Result<String, VerificationError> {
        let source = self
            .sources
            .get(&request.step)
            .ok_or_else(|| VerificationError::MissingSource(request.step.clone()))?;

        let address = request.address.to_string();
        let constructor_args = request.encoded_constructor_args();

        let response = self
            .post(&[
                ("apikey", self.api_key.as_str()),
                ("module", "contract"),
                ("action", "verifysourcecode"),
                ("contractaddress", address.as_str()),
                ("sourceCode", source.source_code.as_str()),
                ("codeformat", "solidity-standard-json-input"),
                ("contractname", source.contract_name.as_str()),
                ("compilerversion", source.compiler_version.as_str()),
                // The misspelling is part of the Etherscan API.
                ("constructorArguements", constructor_args.as_str()),
            ])
            .await?;

        match response.classify_submission() {
            ExplorerReply::Submitted(guid) => Ok(guid),
            ExplorerReply::Failed(err) => Err(err),
            ExplorerReply::Verified | ExplorerReply::Pending => Err(VerificationError::Rejected(
                "explorer did not return a submission id".to_string(),
            )),
        }
    }

    async fn poll_status(&self, guid: &str) -> Result<(), VerificationError> {
        let check = || async {
            let response = self
                .post(&[
                    ("apikey", self.api_key.as_str()),
                    ("module", "contract"),
                    ("action", "checkverifystatus"),
                    ("guid", guid),
                ])
                .await?;

            match response.classify_status() {
                ExplorerReply::Verified => Ok(Ok(())),
                ExplorerReply::Failed(err) => Ok(Err(err)),
                ExplorerReply::Submitted(_) => Ok(Err(VerificationError::Rejected(
                    "unexpected submission reply while polling".to_string(),
                ))),
                ExplorerReply::Pending => Err(VerificationError::Timeout(
                    STATUS_POLL_INTERVAL * STATUS_POLL_ATTEMPTS as u32,
                )),
            }
        };

        check
            .retry(
                ConstantBuilder::default()
                    .with_delay(STATUS_POLL_INTERVAL)
                    .with_max_times(STATUS_POLL_ATTEMPTS),
            )
            .when(|err| matches!(err, VerificationError::Timeout(_)))
            .notify(|_, delay| {
                tracing::trace!(guid = %guid, ?delay, "Verification pending, polling again...");
            })
            .await?
    }
}

impl Verifier for EtherscanVerifier {
    fn verify<'a>(
        &'a self,
        request: &'a VerificationRequest,
    ) -> BoxFuture<'a, Result<(), VerificationError>> {
        async move {
            let guid = self.submit(request).await?;
            if guid.is_empty() {
                return Ok(());
            }

            tracing::debug!(step = %request.step, guid = %guid, "Verification submitted");
            self.poll_status(&guid).await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: &str, message: &str, result: &str) -> ExplorerResponse {
        ExplorerResponse {
            status: status.to_string(),
            message: message.to_string(),
            result: result.to_string(),
        }
    }

    #[test]
    fn test_classify_submission() {
        let reply = response("1", "OK", "ezq878u486pzijkvvmerl6a9mzwhv6sefgvqi5tkwceejc7tvn")
            .classify_submission();
        assert_eq!(
            reply,
            ExplorerReply::Submitted("ezq878u486pzijkvvmerl6a9mzwhv6sefgvqi5tkwceejc7tvn".to_string())
        );
    }

    #[test]
    fn test_submission_guid_containing_status_words() {
        for guid in ["kpass3xq9vnpendingz", "inqueue7fpassu2"] {
            assert_eq!(
                response("1", "OK", guid).classify_submission(),
                ExplorerReply::Submitted(guid.to_string())
            );
        }
    }

    #[test]
    fn test_classify_submission_rejections() {
        assert_eq!(
            response("0", "NOTOK", "Contract source code already verified").classify_submission(),
            ExplorerReply::Failed(VerificationError::AlreadyVerified)
        );
        assert_eq!(
            response("0", "Invalid API Key", "").classify_submission(),
            ExplorerReply::Failed(VerificationError::Rejected("Invalid API Key".to_string()))
        );
        assert_eq!(
            response("1", "OK", "").classify_submission(),
            ExplorerReply::Failed(VerificationError::Rejected("OK".to_string()))
        );
    }

    #[test]
    fn test_classify_status_replies() {
        assert_eq!(
            response("1", "OK", "Pass - Verified").classify_status(),
            ExplorerReply::Verified
        );
        assert_eq!(
            response("0", "NOTOK", "Pending in queue").classify_status(),
            ExplorerReply::Pending
        );
        assert_eq!(
            response("0", "NOTOK", "Fail - Unable to verify").classify_status(),
            ExplorerReply::Failed(VerificationError::Rejected(
                "Fail - Unable to verify".to_string()
            ))
        );
        assert_eq!(
            response("0", "NOTOK", "Already Verified").classify_status(),
            ExplorerReply::Failed(VerificationError::AlreadyVerified)
        );
    }

    #[test]
    fn test_status_requires_pass_prefix() {
        assert_eq!(
            response("0", "NOTOK", "Fail - bypass not allowed").classify_status(),
            ExplorerReply::Failed(VerificationError::Rejected(
                "Fail - bypass not allowed".to_string()
            ))
        );
    }

    #[test]
    fn test_encoded_constructor_args() {
        let request = VerificationRequest {
            step: "WalletFactory".to_string(),
            address: Address::ZERO,
            constructor_args: vec![
                Bytes::from_static(&[0xab, 0xcd]),
                Bytes::from_static(&[0x01]),
            ],
        };
        assert_eq!(request.encoded_constructor_args(), "abcd01");
    }

    #[tokio::test]
    async fn test_missing_source_is_reported() {
        let verifier =
            EtherscanVerifier::new("https://api.etherscan.io/api".parse().unwrap(), "key").unwrap();
        let request = VerificationRequest {
            step: "Wallet".to_string(),
            address: Address::ZERO,
            constructor_args: vec![],
        };

        let err = verifier.verify(&request).await.unwrap_err();
        assert_eq!(err, VerificationError::MissingSource("Wallet".to_string()));
    }
}
