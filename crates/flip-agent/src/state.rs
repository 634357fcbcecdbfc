//! Shared agent state for the HTTP handlers.

use std::time::Instant;
use tokio::sync::watch;

use flip_scoring::{DeterministicPolicy, PolicyKind};
use flip_settlement::OrchestratorStats;

/// View of the running agent shared with the API server.
pub struct AgentState {
    /// When the agent started.
    pub start_time: Instant,
    /// Whether collaborators are in-memory.
    pub dry_run: bool,
    pub policy: PolicyKind,
    /// Identifier of the payment rail in use.
    pub rail: String,
    /// Latest snapshot published by the orchestrator.
    stats: watch::Receiver<OrchestratorStats>,
    /// Shares the orchestrator's volatility when the deterministic policy
    /// is active.
    volatility_feed: Option<DeterministicPolicy>,
}

impl AgentState {
    pub fn new(
        dry_run: bool,
        policy: PolicyKind,
        rail: impl Into<String>,
        stats: watch::Receiver<OrchestratorStats>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            dry_run,
            policy,
            rail: rail.into(),
            stats,
            volatility_feed: None,
        }
    }

    /// Accept price windows for `policy`. Clones share the volatility, so
    /// updates reach the orchestrator's copy.
    pub fn with_volatility_feed(mut self, policy: DeterministicPolicy) -> Self {
        self.volatility_feed = Some(policy);
        self
    }

    pub fn volatility_feed(&self) -> Option<&DeterministicPolicy> {
        self.volatility_feed.as_ref()
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.borrow().clone()
    }

    /// Recovery has finished once its report has been published.
    pub fn recovered(&self) -> bool {
        self.stats.borrow().recovery.is_some()
    }
}
