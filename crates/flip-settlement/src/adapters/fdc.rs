//! Flare Data Connector attestation pipeline.
//!
//! A proof for an XRPL payment takes four steps: the verifier encodes the
//! request, the request is submitted on-chain, the voting round containing
//! it finalizes, and the data-availability layer serves the Merkle proof.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use flip_core::AttestationProof;

use crate::error::SettlementError;
use crate::retry::poll_until;
use crate::shutdown::ShutdownSignal;
use crate::traits::{AttestationService, LedgerClient};

/// Endpoints and round timing for the attestation network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FdcConfig {
    pub verifier_url: String,
    pub da_layer_url: String,
    #[serde(skip_serializing, default)]
    pub api_key: String,
    /// Source chain identifier, e.g. "testXRP".
    #[serde(default = "default_source_id")]
    pub source_id: String,
    #[serde(default = "default_first_round_ts")]
    pub first_voting_round_start_ts: u64,
    #[serde(default = "default_epoch_secs")]
    pub voting_epoch_duration_secs: u64,
    /// Give up waiting for a round after this long.
    #[serde(default = "default_round_timeout")]
    pub round_timeout_secs: u64,
    #[serde(default = "default_round_poll")]
    pub round_poll_secs: u64,
}

fn default_source_id() -> String {
    "testXRP".to_string()
}
fn default_first_round_ts() -> u64 {
    1_658_430_000
}
fn default_epoch_secs() -> u64 {
    90
}
fn default_round_timeout() -> u64 {
    300
}
fn default_round_poll() -> u64 {
    10
}

impl Default for FdcConfig {
    fn default() -> Self {
        Self {
            verifier_url: "https://fdc-verifiers-testnet.flare.network".to_string(),
            da_layer_url: "https://ctn2-data-availability.flare.network".to_string(),
            api_key: String::new(),
            source_id: default_source_id(),
            first_voting_round_start_ts: default_first_round_ts(),
            voting_epoch_duration_secs: default_epoch_secs(),
            round_timeout_secs: default_round_timeout(),
            round_poll_secs: default_round_poll(),
        }
    }
}

impl FdcConfig {
    /// Voting round that includes a request submitted at `timestamp`.
    pub fn round_for_timestamp(&self, timestamp: u64) -> u64 {
        timestamp.saturating_sub(self.first_voting_round_start_ts)
            / self.voting_epoch_duration_secs.max(1)
    }

    fn round_poll_attempts(&self) -> u32 {
        let attempts = self.round_timeout_secs / self.round_poll_secs.max(1);
        u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
    }
}

/// UTF-8 bytes of `s`, zero-padded to 32 bytes, as `0x` hex.
pub fn encode_to_hex32(s: &str) -> String {
    let mut buf = [0u8; 32];
    let bytes = s.as_bytes();
    let len = bytes.len().min(32);
    buf[..len].copy_from_slice(&bytes[..len]);
    format!("0x{}", hex::encode(buf))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrepareResponse {
    #[serde(default)]
    abi_encoded_request: String,
}

#[derive(Debug, Default, Deserialize)]
struct FspStatus {
    #[serde(default)]
    latest_fdc: LatestRound,
}

#[derive(Debug, Default, Deserialize)]
struct LatestRound {
    #[serde(default)]
    voting_round_id: u64,
}

#[derive(Debug, Deserialize)]
struct DaProof {
    #[serde(default)]
    proof: Vec<String>,
    #[serde(default)]
    response: serde_json::Value,
}

/// [`AttestationService`] that drives the full FDC flow.
pub struct FdcAttestationService {
    client: reqwest::Client,
    config: FdcConfig,
    ledger: Arc<dyn LedgerClient>,
    shutdown: ShutdownSignal,
}

impl FdcAttestationService {
    pub fn new(config: FdcConfig, ledger: Arc<dyn LedgerClient>, shutdown: ShutdownSignal) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            ledger,
            shutdown,
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, url);
        if !self.config.api_key.is_empty() {
            request = request.header("X-API-KEY", &self.config.api_key);
        }
        request
    }

    /// Ask the verifier to encode an attestation request for a payment.
    pub async fn prepare_request(&self, tx_hash: &str) -> Result<String, SettlementError> {
        let url = format!(
            "{}/verifier/xrp/Payment/prepareRequest",
            self.config.verifier_url
        );
        let body = json!({
            "attestationType": encode_to_hex32("Payment"),
            "sourceId": encode_to_hex32(&self.config.source_id),
            "requestBody": {
                "transactionId": tx_hash,
                "inUtxo": "0",
                "utxo": "0",
            },
        });
        let response = self.request(reqwest::Method::POST, &url).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            tracing::error!(%status, body = %text, "verifier error");
            return Err(SettlementError::Transport(format!(
                "verifier returned {}: {}",
                status, text
            )));
        }
        let prepared: PrepareResponse = response.json().await?;
        if prepared.abi_encoded_request.is_empty() {
            return Err(SettlementError::ProofUnavailable(format!(
                "verifier has not indexed {} yet",
                tx_hash
            )));
        }
        Ok(prepared.abi_encoded_request)
    }

    /// Latest voting round the data-availability layer has finalized.
    pub async fn latest_finalized_round(&self) -> Result<u64, SettlementError> {
        let url = format!("{}/api/v0/fsp/status", self.config.da_layer_url);
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        if !response.status().is_success() {
            return Err(SettlementError::Transport(format!(
                "fsp status returned {}",
                response.status()
            )));
        }
        let status: FspStatus = response.json().await?;
        Ok(status.latest_fdc.voting_round_id)
    }

    async fn wait_for_round(&self, round_id: u64) -> Result<(), SettlementError> {
        let finalized = poll_until(
            self.config.round_poll_attempts(),
            Duration::from_secs(self.config.round_poll_secs),
            &self.shutdown,
            move || async move {
                let latest = self.latest_finalized_round().await?;
                tracing::debug!(target_round = round_id, latest_round = latest, "checking round");
                Ok((latest >= round_id).then_some(latest))
            },
        )
        .await?;
        match finalized {
            Some(_) => {
                tracing::info!(round_id, "voting round finalized");
                Ok(())
            }
            None => Err(SettlementError::ProofUnavailable(format!(
                "round {} not finalized within {}s",
                round_id, self.config.round_timeout_secs
            ))),
        }
    }

    /// Fetch the Merkle proof for an encoded request from a finalized round.
    pub async fn fetch_proof(
        &self,
        round_id: u64,
        request_bytes: &str,
    ) -> Result<AttestationProof, SettlementError> {
        let url = format!(
            "{}/api/v1/fdc/proof-by-request-round",
            self.config.da_layer_url
        );
        let body = json!({ "votingRoundId": round_id, "requestBytes": request_bytes });
        let response = self.request(reqwest::Method::POST, &url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(SettlementError::Transport(format!(
                "DA layer returned {}",
                response.status()
            )));
        }
        let proof: DaProof = response.json().await?;
        if proof.proof.is_empty() {
            return Err(SettlementError::ProofUnavailable(format!(
                "empty proof for round {}",
                round_id
            )));
        }
        Ok(AttestationProof {
            merkle_proof: proof.proof,
            response: proof.response,
            round_id,
        })
    }
}

#[async_trait]
impl AttestationService for FdcAttestationService {
    async fn request_proof(&self, tx_hash: &str) -> Result<AttestationProof, SettlementError> {
        let encoded = self.prepare_request(tx_hash).await?;
        tracing::info!(xrpl_tx = tx_hash, "attestation request prepared");

        let bytes = hex::decode(encoded.trim_start_matches("0x")).map_err(|e| {
            SettlementError::ProofUnavailable(format!("verifier returned bad hex: {}", e))
        })?;
        let submitted_at = self.ledger.request_attestation(&bytes).await?;
        let round_id = self.config.round_for_timestamp(submitted_at);
        tracing::info!(round_id, submitted_at, "attestation request submitted");

        self.wait_for_round(round_id).await?;
        self.fetch_proof(round_id, &encoded).await
    }
}
