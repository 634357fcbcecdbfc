//! The settlement agent.
//!
//! Builds the collaborators from configuration, starts the HTTP API, runs the
//! recovery scans, then spawns one producer per event kind and hands the
//! queues to the orchestrator.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

use flip_core::Address;
use flip_scoring::{DeterministicPolicy, DeterministicScorer, PolicyKind, ScoringPolicy};
use flip_settlement::adapters::{
    EvmLedger, FdcAttestationService, MemoryAttestation, MemoryLedger, MemoryRail, XrplRail,
};
use flip_settlement::{
    event_channels, shutdown_channel, AttestationService, ChainEventSource, EventProducer,
    EventQueues, LedgerClient, OrchestratorStats, PaymentRail, RecoveryReport,
    SettlementError, SettlementOrchestrator, ShutdownSignal, ShutdownTrigger,
};

use crate::config::FlipConfig;
use crate::state::AgentState;

/// Rail balance the dry-run rail starts with, in drops.
const DRY_RUN_RAIL_BALANCE: u64 = 1_000_000_000_000;

/// Ledger, rail, and attestation clients the agent runs against.
///
/// Either everything is in-process (dry run) or everything is live; a live
/// rail never pays out against an in-process ledger.
struct Collaborators {
    ledger: Arc<dyn LedgerClient>,
    events: Arc<dyn ChainEventSource>,
    rail: Arc<dyn PaymentRail>,
    attestation: Arc<dyn AttestationService>,
    memory_ledger: Option<Arc<MemoryLedger>>,
    evm_ledger: Option<Arc<EvmLedger>>,
}

/// The settlement agent, owning every task it spawns.
pub struct FlipAgent {
    config: FlipConfig,
    dry_run: bool,
    trigger: Arc<ShutdownTrigger>,
    signal: ShutdownSignal,
    collaborators: Collaborators,
    orchestrator: Option<SettlementOrchestrator>,
    queues: Option<EventQueues>,
    producers: Vec<JoinHandle<()>>,
    state: Option<Arc<AgentState>>,
}

impl FlipAgent {
    /// Create the agent. Fails on configuration the agent cannot run with.
    pub fn new(config: FlipConfig, dry_run: bool) -> Result<Self> {
        config.validate(dry_run)?;
        let (trigger, signal) = shutdown_channel();
        let collaborators = Self::build_collaborators(&config, dry_run, &signal)?;
        let policy = Self::build_policy(&config)?;

        let orchestrator = SettlementOrchestrator::new(
            collaborators.ledger.clone(),
            collaborators.rail.clone(),
            collaborators.attestation.clone(),
            config.agent.settlement.clone(),
            signal.clone(),
        )
        .with_policy(policy);

        tracing::info!(
            dry_run,
            rail = collaborators.rail.rail_id(),
            policy = ?config.agent.scoring_policy,
            "settlement agent created"
        );

        Ok(Self {
            config,
            dry_run,
            trigger: Arc::new(trigger),
            signal,
            collaborators,
            orchestrator: Some(orchestrator),
            queues: None,
            producers: Vec::new(),
            state: None,
        })
    }

    fn build_collaborators(
        config: &FlipConfig,
        dry_run: bool,
        signal: &ShutdownSignal,
    ) -> Result<Collaborators, SettlementError> {
        if dry_run {
            let ledger = Arc::new(MemoryLedger::new(Address::ZERO));
            let rail = Arc::new(MemoryRail::new(DRY_RUN_RAIL_BALANCE));
            let attestation = Arc::new(MemoryAttestation::new(rail.clone()));
            return Ok(Collaborators {
                ledger: ledger.clone(),
                events: ledger.clone(),
                rail,
                attestation,
                memory_ledger: Some(ledger),
                evm_ledger: None,
            });
        }

        let evm = Arc::new(EvmLedger::new(config.ledger.clone())?);
        let ledger: Arc<dyn LedgerClient> = evm.clone();
        let attestation = Arc::new(FdcAttestationService::new(
            config.fdc.clone(),
            ledger.clone(),
            signal.clone(),
        ));
        Ok(Collaborators {
            ledger,
            events: evm.clone(),
            rail: Arc::new(XrplRail::new(config.xrpl.clone())),
            attestation,
            memory_ledger: None,
            evm_ledger: Some(evm),
        })
    }

    fn build_policy(config: &FlipConfig) -> Result<ScoringPolicy, SettlementError> {
        let agent = &config.agent;
        Ok(match agent.scoring_policy {
            PolicyKind::Fixed => ScoringPolicy::Fixed(agent.fixed.clone()),
            PolicyKind::Deterministic => {
                let scorer = DeterministicScorer::new(agent.scorer.clone())
                    .map_err(|e| SettlementError::Configuration(e.to_string()))?;
                ScoringPolicy::Deterministic(DeterministicPolicy::new(
                    scorer,
                    agent.profile.clone(),
                    agent.initial_volatility,
                ))
            }
        })
    }

    /// Spawn the HTTP API, run the recovery scans, then spawn the producers.
    ///
    /// Producers start only after recovery so no live event races a scan.
    /// Health reports 503 until the scans finish.
    pub async fn start(&mut self) -> Result<RecoveryReport> {
        let orchestrator = self
            .orchestrator
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("agent already running"))?;

        if let Some(evm) = &self.collaborators.evm_ledger {
            evm.verify_chain().await?;
        }
        let operator = self.collaborators.ledger.operator().await?;
        tracing::info!(%operator, "connected to ledger");

        let mut state = AgentState::new(
            self.dry_run,
            orchestrator.policy().kind(),
            self.collaborators.rail.rail_id(),
            orchestrator.subscribe_stats(),
        );
        if let ScoringPolicy::Deterministic(policy) = orchestrator.policy() {
            state = state.with_volatility_feed(policy.clone());
        }
        let state = Arc::new(state);
        if self.config.api.enabled {
            let api_addr: SocketAddr =
                format!("{}:{}", self.config.api.listen_addr, self.config.api.port).parse()?;
            let api_state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::api::start_api_server(api_addr, api_state).await {
                    tracing::error!(error = %e, "HTTP API server error");
                }
            });
        }
        self.state = Some(state);

        let report = orchestrator.recover().await?;

        let settlement = &self.config.agent.settlement;
        let (sinks, queues) = event_channels(settlement.queue_capacity);
        for sink in sinks.into_sinks() {
            let producer = EventProducer::new(
                self.collaborators.events.clone(),
                self.collaborators.ledger.clone(),
                sink,
                settlement,
                self.signal.clone(),
            );
            self.producers.push(tokio::spawn(producer.run()));
        }
        self.queues = Some(queues);
        tracing::info!(producers = self.producers.len(), "event producers started");
        Ok(report)
    }

    /// Run the orchestrator loop until shutdown is triggered.
    pub async fn run(&mut self) -> Result<OrchestratorStats> {
        let queues = self
            .queues
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent not started"))?;
        let orchestrator = self
            .orchestrator
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent not started"))?;
        tracing::info!("entering main event loop");
        Ok(orchestrator.run(queues).await)
    }

    /// Handle for firing shutdown from outside the agent.
    pub fn shutdown_trigger(&self) -> Arc<ShutdownTrigger> {
        self.trigger.clone()
    }

    /// Stop the producers and wait for them to exit.
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("shutting down settlement agent");
        self.trigger.trigger();
        for handle in self.producers.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "producer task ended abnormally");
            }
        }
        self.state = None;
        tracing::info!("settlement agent shut down");
        Ok(())
    }

    /// The in-process ledger, when the memory backend is in use.
    pub fn memory_ledger(&self) -> Option<Arc<MemoryLedger>> {
        self.collaborators.memory_ledger.clone()
    }

    pub fn state(&self) -> Option<&Arc<AgentState>> {
        self.state.as_ref()
    }
}
