//! HTTP API server for the settlement agent.
//!
//! Endpoints exposing the orchestrator's latest stats snapshot, plus a price
//! intake that updates the deterministic scorer's volatility.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use flip_scoring::PolicyKind;
use flip_settlement::OrchestratorStats;

use crate::state::AgentState;

// --- Response types ---

#[derive(Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_secs: u64,
    pub dry_run: bool,
    pub policy: PolicyKind,
    pub rail: String,
    /// Volatility the deterministic scorer is using, if it is active.
    pub volatility: Option<u128>,
    pub stats: OrchestratorStats,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub recovered: bool,
}

/// Recent prices of the settled asset, oldest first.
#[derive(Deserialize)]
pub struct PriceWindowRequest {
    pub prices: Vec<u64>,
}

#[derive(Serialize)]
pub struct VolatilityResponse {
    pub volatility: u128,
    pub samples: usize,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn api_error(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

// --- Handlers ---

async fn handle_status(State(state): State<Arc<AgentState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        dry_run: state.dry_run,
        policy: state.policy,
        rail: state.rail.clone(),
        volatility: state.volatility_feed().map(|policy| policy.volatility()),
        stats: state.stats(),
    })
}

/// Recompute scorer volatility from a price window.
async fn handle_observe_prices(
    State(state): State<Arc<AgentState>>,
    Json(req): Json<PriceWindowRequest>,
) -> Result<Json<VolatilityResponse>, (StatusCode, Json<ErrorResponse>)> {
    let Some(policy) = state.volatility_feed() else {
        return Err(api_error(
            StatusCode::CONFLICT,
            "scoring policy is not deterministic",
        ));
    };
    if req.prices.len() < 2 {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "at least two prices are required",
        ));
    }
    let prices: Vec<u128> = req.prices.iter().map(|p| u128::from(*p)).collect();
    let volatility = policy.observe_prices(&prices);
    tracing::info!(samples = prices.len(), volatility, "volatility updated from price window");
    Ok(Json(VolatilityResponse {
        volatility,
        samples: prices.len(),
    }))
}

/// 503 until the recovery scans have run.
async fn handle_health(
    State(state): State<Arc<AgentState>>,
) -> (StatusCode, Json<HealthResponse>) {
    if state.recovered() {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                recovered: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "recovering",
                recovered: false,
            }),
        )
    }
}

// --- Server ---

pub fn build_router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/api/v1/status", get(handle_status))
        .route("/api/v1/health", get(handle_health))
        .route("/api/v1/prices", post(handle_observe_prices))
        .with_state(state)
}

pub async fn start_api_server(listen_addr: SocketAddr, state: Arc<AgentState>) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "HTTP API server started");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flip_scoring::{AgentProfile, DeterministicPolicy, DeterministicScorer};
    use flip_settlement::RecoveryReport;
    use tokio::sync::watch;

    async fn serve(state: Arc<AgentState>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_health_reflects_recovery() {
        let (tx, rx) = watch::channel(OrchestratorStats::default());
        let state = Arc::new(AgentState::new(true, PolicyKind::Fixed, "memory", rx));
        let base = serve(state).await;

        let resp = reqwest::get(format!("{}/api/v1/health", base)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        tx.send_replace(OrchestratorStats {
            recovery: Some(RecoveryReport::default()),
            ..OrchestratorStats::default()
        });
        let resp = reqwest::get(format!("{}/api/v1/health", base)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_reports_stats() {
        let (tx, rx) = watch::channel(OrchestratorStats::default());
        let state = Arc::new(AgentState::new(false, PolicyKind::Deterministic, "xrpl", rx));
        let base = serve(state).await;
        tx.send_replace(OrchestratorStats {
            payments_sent: 3,
            ..OrchestratorStats::default()
        });

        let body: serde_json::Value = reqwest::get(format!("{}/api/v1/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["policy"], "deterministic");
        assert_eq!(body["rail"], "xrpl");
        assert_eq!(body["dry_run"], false);
        assert_eq!(body["stats"]["payments_sent"], 3);
    }

    #[tokio::test]
    async fn test_price_window_updates_scorer_volatility() {
        let (_tx, rx) = watch::channel(OrchestratorStats::default());
        let policy = DeterministicPolicy::new(
            DeterministicScorer::default(),
            AgentProfile::default(),
            10_000,
        );
        let orchestrator_copy = policy.clone();
        let state = Arc::new(
            AgentState::new(false, PolicyKind::Deterministic, "xrpl", rx)
                .with_volatility_feed(policy),
        );
        let base = serve(state).await;
        let client = reqwest::Client::new();

        // mean 1_000, population std dev 100
        let resp = client
            .post(format!("{}/api/v1/prices", base))
            .json(&serde_json::json!({ "prices": [900, 1_100, 900, 1_100] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["volatility"], 100_000);
        assert_eq!(orchestrator_copy.volatility(), 100_000);

        let status: serde_json::Value = reqwest::get(format!("{}/api/v1/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["volatility"], 100_000);

        let resp = client
            .post(format!("{}/api/v1/prices", base))
            .json(&serde_json::json!({ "prices": [1_000] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(orchestrator_copy.volatility(), 100_000);
    }

    #[tokio::test]
    async fn test_prices_rejected_under_fixed_policy() {
        let (_tx, rx) = watch::channel(OrchestratorStats::default());
        let state = Arc::new(AgentState::new(true, PolicyKind::Fixed, "memory", rx));
        let base = serve(state).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/api/v1/prices", base))
            .json(&serde_json::json!({ "prices": [1, 2, 3] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "scoring policy is not deterministic");
    }
}
