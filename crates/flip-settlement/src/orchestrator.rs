//! The settlement orchestrator.
//!
//! A single task owns all per-request bookkeeping and processes one event to
//! completion before taking the next, so at most one transition is in flight
//! for any request id. Durable state lives on the ledger: a redemption's
//! status and recorded payment hash are the checkpoints recovery resumes from.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use flip_core::{
    EscrowCreated, MintingRequested, MintingStatus, RedemptionId, RedemptionRequested,
    RedemptionStatus, SettlementConfig, SettlementStage, StageEvent,
};
use flip_scoring::ScoringPolicy;

use crate::error::SettlementError;
use crate::idempotency::{FinishedCounts, ProcessedSet, StageTracker};
use crate::liquidity::{check_liquidity, LiquidityCheck};
use crate::payment::PaymentDispatcher;
use crate::producer::EventQueues;
use crate::recovery::RecoveryReport;
use crate::retry::{retry, retry_if, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use crate::traits::{ensure_success, AttestationService, LedgerClient, PaymentRail};

/// Result of one attestation attempt for a sent payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationOutcome {
    /// The ledger accepted the outcome derived from the proof.
    Submitted { success: bool },
    /// No proof yet; the payment stays recorded for a later retry.
    ProofPending,
    /// A proof was obtained but every submission attempt failed.
    SubmissionFailed,
}

/// Result of handling a minting request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MintingOutcome {
    Processed,
    AlreadyProcessed,
    /// Skipped until active liquidity covers the amount.
    Deferred { available: u128, required: u128 },
}

/// Counters and in-flight redemption stages, published after every event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorStats {
    pub redemptions_processed: u64,
    pub escrows_handled: u64,
    pub payments_sent: u64,
    pub proofs_submitted: u64,
    pub proofs_pending: u64,
    pub mintings_processed: u64,
    pub mintings_deferred: u64,
    pub failures: u64,
    pub recovery: Option<RecoveryReport>,
    /// Redemptions not yet in a final stage.
    pub stages: BTreeMap<u64, SettlementStage>,
    pub finished: FinishedCounts,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Drives redemptions and mintings through their settlement lifecycles.
pub struct SettlementOrchestrator {
    pub(crate) ledger: Arc<dyn LedgerClient>,
    attestation: Arc<dyn AttestationService>,
    dispatcher: PaymentDispatcher,
    policy: ScoringPolicy,
    config: SettlementConfig,
    pub(crate) processed: ProcessedSet,
    pub(crate) stages: StageTracker,
    pub(crate) stats: OrchestratorStats,
    stats_tx: watch::Sender<OrchestratorStats>,
    pub(crate) shutdown: ShutdownSignal,
}

impl SettlementOrchestrator {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        rail: Arc<dyn PaymentRail>,
        attestation: Arc<dyn AttestationService>,
        config: SettlementConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (stats_tx, _) = watch::channel(OrchestratorStats::default());
        Self {
            ledger,
            attestation,
            dispatcher: PaymentDispatcher::new(rail, &config),
            policy: ScoringPolicy::default(),
            config,
            processed: ProcessedSet::new(),
            stages: StageTracker::new(),
            stats: OrchestratorStats::default(),
            stats_tx,
            shutdown,
        }
    }

    /// Replace the scoring policy used for ledger processing calls.
    pub fn with_policy(mut self, policy: ScoringPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Receive a fresh [`OrchestratorStats`] after every handled event.
    pub fn subscribe_stats(&self) -> watch::Receiver<OrchestratorStats> {
        self.stats_tx.subscribe()
    }

    pub fn stats(&self) -> &OrchestratorStats {
        &self.stats
    }

    pub fn processed(&self) -> &ProcessedSet {
        &self.processed
    }

    pub fn stage(&self, id: RedemptionId) -> Option<SettlementStage> {
        self.stages.get(id)
    }

    /// Move a redemption to `PaymentSent` whether or not it was tracked.
    fn note_payment_sent(&mut self, id: RedemptionId) {
        match self.stages.get(id) {
            Some(SettlementStage::EscrowCreated) => {
                self.stages.advance(id, StageEvent::PaymentSent);
            }
            _ => self.stages.seed(id, SettlementStage::PaymentSent),
        }
    }

    pub(crate) fn publish(&mut self) {
        self.stats.stages = self.stages.snapshot();
        self.stats.finished = self.stages.finished();
        self.stats.last_event_at = Some(Utc::now());
        self.stats_tx.send_replace(self.stats.clone());
    }

    /// Create the escrow for a newly requested redemption.
    ///
    /// Errors leave the id unmarked so a later delivery retries it.
    pub async fn handle_redemption_requested(
        &mut self,
        event: &RedemptionRequested,
    ) -> Result<(), SettlementError> {
        let id = event.redemption_id;
        if self.processed.is_escrowed(id) {
            debug!(redemption_id = id.0, "redemption already processed, skipping");
            return Ok(());
        }

        let redemption = self.ledger.redemption(id).await?;
        if redemption.status != RedemptionStatus::Pending {
            debug!(
                redemption_id = id.0,
                status = %redemption.status,
                "redemption already past pending"
            );
            self.processed.mark_escrowed(id);
            return Ok(());
        }

        info!(
            redemption_id = id.0,
            user = %event.user,
            destination = %event.destination,
            amount = event.amount,
            policy = ?self.policy.kind(),
            "processing redemption request"
        );
        let outcome = self.policy.for_redemption(&redemption);
        let receipt = ensure_success(
            "processRedemption",
            self.ledger.process_redemption(id, outcome.args).await?,
        )?;

        self.processed.mark_escrowed(id);
        self.stages.advance(id, StageEvent::EscrowCreated);
        self.stats.redemptions_processed += 1;
        info!(
            redemption_id = id.0,
            tx_hash = %receipt.tx_hash,
            gas_used = receipt.gas_used,
            "escrow created"
        );
        Ok(())
    }

    /// Pay out an escrowed redemption, record the payment, and attest it.
    ///
    /// Once the payment is broadcast this returns `Ok` even if recording or
    /// attestation fails: the recorded hash lets recovery finish the job
    /// without paying again.
    pub async fn handle_escrow_created(
        &mut self,
        event: &EscrowCreated,
    ) -> Result<(), SettlementError> {
        let id = event.redemption_id;
        if self.processed.is_paid(id) {
            debug!(redemption_id = id.0, "payment already sent, skipping");
            return Ok(());
        }
        if let Some(existing) = self.ledger.recorded_payment(id).await? {
            info!(
                redemption_id = id.0,
                existing_tx_hash = %existing,
                "payment already recorded on ledger, skipping"
            );
            self.processed.mark_paid(id);
            self.note_payment_sent(id);
            return Ok(());
        }
        if event.destination.is_empty() {
            return Err(SettlementError::Internal(format!(
                "redemption {} has no payout destination",
                id
            )));
        }

        info!(
            redemption_id = id.0,
            destination = %event.destination,
            amount = event.amount,
            "processing escrow"
        );
        self.stats.escrows_handled += 1;
        self.stages.seed(id, SettlementStage::EscrowCreated);

        let tx_hash = self
            .dispatcher
            .send(&event.destination, event.amount, &event.reference, &self.shutdown)
            .await?;
        self.processed.mark_paid(id);
        self.stages.advance(id, StageEvent::PaymentSent);
        self.stats.payments_sent += 1;

        if let Err(e) = self.record_payment(id, &tx_hash).await {
            if e.is_cancelled() {
                return Err(e);
            }
            warn!(
                redemption_id = id.0,
                %tx_hash,
                error = %e,
                "failed to record payment on ledger, continuing"
            );
        }

        let finalized = match self
            .dispatcher
            .wait_for_finalization(&tx_hash, &self.shutdown)
            .await
        {
            Ok(()) => true,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(redemption_id = id.0, %tx_hash, error = %e, "payment not final yet");
                false
            }
        };

        let outcome = self.attest(id, &tx_hash).await?;
        if !finalized && outcome == AttestationOutcome::ProofPending {
            self.stages.advance(id, StageEvent::TimedOut);
        }
        Ok(())
    }

    async fn record_payment(&self, id: RedemptionId, tx_hash: &str) -> Result<(), SettlementError> {
        let policy = RetryPolicy::fixed(
            self.config.record_payment_attempts,
            self.config.payment_retry_delay(),
        );
        let ledger = &self.ledger;
        let receipt = retry(&policy, &self.shutdown, "record_external_payment", |_| async move {
            ensure_success(
                "recordExternalPayment",
                ledger.record_external_payment(id, tx_hash).await?,
            )
        })
        .await?;
        info!(redemption_id = id.0, %tx_hash, ledger_tx = %receipt.tx_hash, "payment recorded");
        Ok(())
    }

    /// Obtain a proof for a sent payment and submit the outcome to the ledger.
    ///
    /// Proof and submission failures are contained: they are logged and
    /// reported through the returned outcome. Only cancellation is an error.
    pub async fn attest(
        &mut self,
        id: RedemptionId,
        tx_hash: &str,
    ) -> Result<AttestationOutcome, SettlementError> {
        self.note_payment_sent(id);

        let proof = match self.attestation.request_proof(tx_hash).await {
            Ok(proof) => proof,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(
                    redemption_id = id.0,
                    %tx_hash,
                    error = %e,
                    "proof unavailable, payment stays recorded for retry"
                );
                self.stats.proofs_pending += 1;
                return Ok(AttestationOutcome::ProofPending);
            }
        };
        self.stages.advance(id, StageEvent::ProofObtained);

        let success = proof.payment_succeeded();
        let request_id = proof.request_id();
        info!(redemption_id = id.0, round_id = proof.round_id, success, "proof obtained");

        let policy = RetryPolicy::fixed(
            self.config.proof_submit_attempts,
            self.config.proof_submit_delay(),
        );
        let ledger = &self.ledger;
        let submitted = retry_if(
            &policy,
            &self.shutdown,
            "submit_attestation",
            |e| !e.is_cancelled(),
            |_| async move {
                ensure_success(
                    "submitAttestation",
                    ledger.submit_attestation(id, request_id, success).await?,
                )
            },
        )
        .await;

        match submitted {
            Ok(receipt) => {
                let event = if success {
                    StageEvent::OutcomeAccepted
                } else {
                    StageEvent::Failed
                };
                self.stages.advance(id, event);
                self.stats.proofs_submitted += 1;
                info!(
                    redemption_id = id.0,
                    tx_hash = %receipt.tx_hash,
                    success,
                    "attestation submitted, redemption settled"
                );
                Ok(AttestationOutcome::Submitted { success })
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                error!(
                    redemption_id = id.0,
                    error = %e,
                    "attestation submission failed after all attempts"
                );
                self.stages.advance(id, StageEvent::SubmissionExhausted);
                self.stats.failures += 1;
                Ok(AttestationOutcome::SubmissionFailed)
            }
        }
    }

    /// Provisionally settle a minting, subject to the liquidity pre-check.
    pub async fn handle_minting_requested(
        &mut self,
        event: &MintingRequested,
    ) -> Result<MintingOutcome, SettlementError> {
        let id = event.minting_id;
        if self.processed.is_minted(id) {
            debug!(minting_id = id.0, "minting already processed, skipping");
            return Ok(MintingOutcome::AlreadyProcessed);
        }

        let minting = self.ledger.minting(id).await?;
        if minting.status != MintingStatus::Pending {
            debug!(minting_id = id.0, status = %minting.status, "minting already settled");
            self.processed.mark_minted(id);
            return Ok(MintingOutcome::AlreadyProcessed);
        }

        if self.config.liquidity_check {
            let check = check_liquidity(self.ledger.as_ref(), minting.asset, minting.amount).await?;
            if let LiquidityCheck::Insufficient {
                available,
                required,
            } = check
            {
                warn!(
                    minting_id = id.0,
                    asset = %minting.asset,
                    available,
                    required,
                    "insufficient provider liquidity, deferring minting"
                );
                self.stats.mintings_deferred += 1;
                return Ok(MintingOutcome::Deferred {
                    available,
                    required,
                });
            }
        }

        info!(
            minting_id = id.0,
            user = %event.user,
            payment_tx_hash = %event.payment_tx_hash,
            amount = event.amount,
            "processing minting request"
        );
        let volatility = self.policy.for_minting(&minting);
        let receipt = ensure_success(
            "processMinting",
            self.ledger.process_minting(id, volatility).await?,
        )?;

        self.processed.mark_minted(id);
        self.stats.mintings_processed += 1;
        info!(minting_id = id.0, tx_hash = %receipt.tx_hash, "minting provisionally settled");
        Ok(MintingOutcome::Processed)
    }

    fn log_failure(&mut self, event: &'static str, id: u64, error: &SettlementError) {
        self.stats.failures += 1;
        error!(event, id, error = %error, kind = ?error.kind(), "failed to handle event");
    }

    /// Consume the three queues until shutdown or until every producer has
    /// gone away. Per-event failures are logged and never end the loop.
    pub async fn run(mut self, mut queues: EventQueues) -> OrchestratorStats {
        info!("orchestrator loop started");
        let shutdown = self.shutdown.clone();
        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = queues.redemptions.recv() => {
                    self.handle_redemption_requested(&event)
                        .await
                        .map_err(|e| ("RedemptionRequested", event.redemption_id.0, e))
                }
                Some(event) = queues.escrows.recv() => {
                    self.handle_escrow_created(&event)
                        .await
                        .map_err(|e| ("EscrowCreated", event.redemption_id.0, e))
                }
                Some(event) = queues.mintings.recv() => {
                    self.handle_minting_requested(&event)
                        .await
                        .map(|_| ())
                        .map_err(|e| ("MintingRequested", event.minting_id.0, e))
                }
                else => break,
            };

            match result {
                Ok(()) => {}
                Err((_, _, e)) if e.is_cancelled() => break,
                Err((kind, id, e)) => self.log_failure(kind, id, &e),
            }
            self.publish();
        }
        self.publish();
        info!(
            payments_sent = self.stats.payments_sent,
            proofs_submitted = self.stats.proofs_submitted,
            failures = self.stats.failures,
            "orchestrator loop stopped"
        );
        self.stats
    }
}

/// Minting request re-synthesized from a stored record.
pub(crate) fn minting_event(minting: &flip_core::Minting) -> MintingRequested {
    MintingRequested {
        minting_id: minting.id,
        user: minting.user,
        asset: minting.asset,
        amount: minting.amount,
        payment_tx_hash: minting.payment_tx_hash.clone(),
    }
}

impl std::fmt::Debug for SettlementOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementOrchestrator")
            .field("policy", &self.policy.kind())
            .field("paid", &self.processed.paid_count())
            .finish()
    }
}
