//! XRPL payment rail over the rippled JSON-RPC API.
//!
//! Payments are signed server-side (`submit` with `secret`), so the agent
//! never handles key material itself.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use flip_core::PaymentReference;

use crate::error::SettlementError;
use crate::traits::PaymentRail;

/// Engine results that mean the transaction was accepted for inclusion.
const ACCEPTED_RESULTS: [&str; 2] = ["tesSUCCESS", "terQUEUED"];

/// Connection settings for an XRPL node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XrplRailConfig {
    pub rpc_url: String,
    /// Classic address of the agent's account.
    pub account: String,
    /// Signing secret passed to `submit`. Never logged.
    #[serde(skip_serializing, default)]
    pub secret: String,
    #[serde(default = "default_fee_drops")]
    pub fee_drops: u64,
}

fn default_fee_drops() -> u64 {
    12
}

impl Default for XrplRailConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://s.altnet.rippletest.net:51234".to_string(),
            account: String::new(),
            secret: String::new(),
            fee_drops: default_fee_drops(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: T,
}

/// Fields shared by every rippled error result.
#[derive(Debug, Default, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl RpcStatus {
    fn into_error(self, method: &str) -> Option<SettlementError> {
        self.error.map(|code| {
            SettlementError::Transport(format!(
                "{} failed: {} {}",
                method,
                code,
                self.error_message.unwrap_or_default()
            ))
        })
    }
}

#[derive(Debug, Deserialize)]
struct AccountInfoResult {
    #[serde(flatten)]
    status: RpcStatus,
    #[serde(default)]
    account_data: Option<AccountData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccountData {
    balance: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResult {
    #[serde(flatten)]
    status: RpcStatus,
    #[serde(default)]
    engine_result: String,
    #[serde(default)]
    engine_result_message: String,
    #[serde(default)]
    tx_json: Option<SubmittedTx>,
}

#[derive(Debug, Deserialize)]
struct SubmittedTx {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    #[serde(flatten)]
    status: RpcStatus,
    #[serde(default)]
    validated: bool,
}

/// [`PaymentRail`] backed by an XRPL node.
#[derive(Debug, Clone)]
pub struct XrplRail {
    client: reqwest::Client,
    config: XrplRailConfig,
}

impl XrplRail {
    pub fn new(config: XrplRailConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: XrplRailConfig) -> Self {
        Self { client, config }
    }

    pub fn account(&self) -> &str {
        &self.config.account
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, SettlementError> {
        let body = json!({ "method": method, "params": [params] });
        let response = self.client.post(&self.config.rpc_url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(SettlementError::Transport(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }
        let envelope: RpcEnvelope<T> = response.json().await?;
        Ok(envelope.result)
    }
}

#[async_trait]
impl PaymentRail for XrplRail {
    async fn balance(&self) -> Result<u128, SettlementError> {
        let result: AccountInfoResult = self
            .call(
                "account_info",
                json!({
                    "account": self.config.account,
                    "strict": true,
                    "ledger_index": "validated",
                }),
            )
            .await?;
        if let Some(err) = result.status.into_error("account_info") {
            return Err(err);
        }
        let data = result
            .account_data
            .ok_or_else(|| SettlementError::Transport("account_info: missing account_data".into()))?;
        data.balance.parse::<u128>().map_err(|_| {
            SettlementError::Transport(format!("account_info: bad balance {:?}", data.balance))
        })
    }

    async fn submit_payment(
        &self,
        destination: &str,
        amount: u128,
        reference: &PaymentReference,
    ) -> Result<String, SettlementError> {
        let tx_json = json!({
            "TransactionType": "Payment",
            "Account": self.config.account,
            "Destination": destination,
            "Amount": amount.to_string(),
            "Fee": self.config.fee_drops.to_string(),
            "Memos": [{ "Memo": { "MemoData": reference.memo_hex() } }],
        });
        let result: SubmitResult = self
            .call(
                "submit",
                json!({ "tx_json": tx_json, "secret": self.config.secret }),
            )
            .await?;
        if let Some(err) = result.status.into_error("submit") {
            return Err(err);
        }
        if !ACCEPTED_RESULTS.contains(&result.engine_result.as_str()) {
            return Err(SettlementError::PaymentRejected(format!(
                "{}: {}",
                result.engine_result, result.engine_result_message
            )));
        }
        let tx = result
            .tx_json
            .ok_or_else(|| SettlementError::Transport("submit: missing tx_json".into()))?;

        tracing::info!(
            tx_hash = %tx.hash,
            destination,
            amount_drops = amount,
            engine_result = %result.engine_result,
            "XRPL payment submitted"
        );
        Ok(tx.hash)
    }

    async fn is_finalized(&self, tx_hash: &str) -> Result<bool, SettlementError> {
        let result: TxResult = self
            .call("tx", json!({ "transaction": tx_hash, "binary": false }))
            .await?;
        // Not yet in a ledger the node has seen.
        if result.status.error.as_deref() == Some("txnNotFound") {
            return Ok(false);
        }
        if let Some(err) = result.status.into_error("tx") {
            return Err(err);
        }
        Ok(result.validated)
    }

    fn rail_id(&self) -> &str {
        "xrpl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::Value;

    /// Minimal rippled stand-in keyed on the JSON-RPC method.
    async fn rippled(Json(body): Json<Value>) -> Json<Value> {
        let params = &body["params"][0];
        let result = match body["method"].as_str().unwrap_or_default() {
            "account_info" => {
                assert_eq!(params["ledger_index"], "validated");
                json!({ "account_data": { "Balance": "25000000" }, "status": "success" })
            }
            "submit" => {
                let tx = &params["tx_json"];
                assert_eq!(tx["Fee"], "12");
                assert_eq!(params["secret"], "sEdTest");
                match tx["Destination"].as_str() {
                    Some("rDry") => json!({
                        "engine_result": "tecPATH_DRY",
                        "engine_result_message": "Path could not send partial amount.",
                        "tx_json": { "hash": "DEAD" },
                    }),
                    _ => json!({
                        "engine_result": "tesSUCCESS",
                        "engine_result_message": "The transaction was applied.",
                        "tx_json": { "hash": format!("H-{}", tx["Memos"][0]["Memo"]["MemoData"].as_str().unwrap_or_default()) },
                    }),
                }
            }
            "tx" => match params["transaction"].as_str() {
                Some("VALIDATED") => json!({ "validated": true }),
                Some("PENDING") => json!({ "validated": false }),
                _ => json!({ "error": "txnNotFound", "status": "error" }),
            },
            _ => json!({ "error": "unknownCmd", "status": "error" }),
        };
        Json(json!({ "result": result }))
    }

    async fn spawn_rail() -> XrplRail {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/", post(rippled)))
                .await
                .unwrap();
        });
        XrplRail::new(XrplRailConfig {
            rpc_url: format!("http://{}/", addr),
            account: "rAgent".into(),
            secret: "sEdTest".into(),
            fee_drops: 12,
        })
    }

    #[tokio::test]
    async fn test_balance_in_drops() {
        let rail = spawn_rail().await;
        assert_eq!(rail.balance().await.unwrap(), 25_000_000);
        assert_eq!(rail.rail_id(), "xrpl");
    }

    #[tokio::test]
    async fn test_submit_attaches_memo() {
        let rail = spawn_rail().await;
        let reference = PaymentReference::from_raw("ab");
        let hash = rail.submit_payment("rUser", 1_000, &reference).await.unwrap();
        assert_eq!(hash, "H-6162");
    }

    #[tokio::test]
    async fn test_submit_rejected_by_engine() {
        let rail = spawn_rail().await;
        let err = rail
            .submit_payment("rDry", 1_000, &PaymentReference::from_raw("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::PaymentRejected(ref m) if m.starts_with("tecPATH_DRY")));
    }

    #[tokio::test]
    async fn test_finality_states() {
        let rail = spawn_rail().await;
        assert!(rail.is_finalized("VALIDATED").await.unwrap());
        assert!(!rail.is_finalized("PENDING").await.unwrap());
        assert!(!rail.is_finalized("MISSING").await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_node_is_transient() {
        let rail = XrplRail::new(XrplRailConfig {
            rpc_url: "http://127.0.0.1:1/".into(),
            account: "rAgent".into(),
            secret: String::new(),
            fee_drops: 12,
        });
        let err = rail.balance().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
