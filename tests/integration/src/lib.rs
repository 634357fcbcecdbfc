//! Shared fixtures for the cross-crate settlement scenarios.

use std::sync::Arc;
use std::time::Duration;

use flip_core::{Address, RedemptionId, RedemptionStatus, SettlementConfig};
use flip_settlement::adapters::{MemoryAttestation, MemoryLedger, MemoryRail};
use flip_settlement::{
    event_channels, EventProducer, EventQueues, OrchestratorStats, SettlementOrchestrator,
    ShutdownSignal,
};

/// Rail balance every scenario starts with, in drops.
pub const RAIL_BALANCE: u64 = 1_000_000_000;

/// A ledger, rail, and attestation network that outlive any one orchestrator,
/// so a test can "restart" the agent against the same external state.
pub struct Scenario {
    pub ledger: Arc<MemoryLedger>,
    pub rail: Arc<MemoryRail>,
    pub attestation: Arc<MemoryAttestation>,
    pub config: SettlementConfig,
}

impl Scenario {
    pub fn new() -> Self {
        let ledger = Arc::new(MemoryLedger::new(Address::repeat_byte(0xAA)));
        let rail = Arc::new(MemoryRail::new(RAIL_BALANCE));
        let attestation = Arc::new(MemoryAttestation::new(rail.clone()));
        Self {
            ledger,
            rail,
            attestation,
            config: SettlementConfig {
                min_rail_balance: 0,
                ..SettlementConfig::immediate()
            },
        }
    }

    /// A fresh orchestrator with empty in-process state.
    pub fn orchestrator(&self, shutdown: ShutdownSignal) -> SettlementOrchestrator {
        SettlementOrchestrator::new(
            self.ledger.clone(),
            self.rail.clone(),
            self.attestation.clone(),
            self.config.clone(),
            shutdown,
        )
    }

    /// Spawn one producer per event kind and return the orchestrator's queues.
    pub fn spawn_producers(&self, shutdown: &ShutdownSignal) -> EventQueues {
        let (sinks, queues) = event_channels(self.config.queue_capacity);
        for sink in sinks.into_sinks() {
            let producer = EventProducer::new(
                self.ledger.clone(),
                self.ledger.clone(),
                sink,
                &self.config,
                shutdown.clone(),
            );
            tokio::spawn(producer.run());
        }
        queues
    }

    /// Request a redemption from a fixed user.
    pub fn redeem(&self, amount: u128, destination: &str) -> RedemptionId {
        self.ledger
            .request_redemption(Address::repeat_byte(1), Address::repeat_byte(2), amount, destination)
    }

    pub fn status(&self, id: RedemptionId) -> Option<RedemptionStatus> {
        self.ledger.redemption_snapshot(id).map(|r| r.status)
    }

    /// Poll until every id reaches `status`, or panic after `timeout`.
    pub async fn wait_for_status(&self, ids: &[RedemptionId], status: RedemptionStatus, timeout: Duration) {
        let reached = tokio::time::timeout(timeout, async {
            while !ids.iter().all(|id| self.status(*id) == Some(status)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "redemptions {:?} did not reach {}", ids, status);
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for a stats snapshot matching `predicate`.
pub async fn wait_for_stats(
    rx: &mut tokio::sync::watch::Receiver<OrchestratorStats>,
    predicate: impl FnMut(&OrchestratorStats) -> bool,
) -> OrchestratorStats {
    let stats = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
        .await
        .expect("stats condition not reached in time")
        .expect("orchestrator dropped its stats channel");
    (*stats).clone()
}
