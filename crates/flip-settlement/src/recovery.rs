//! Startup recovery scans.
//!
//! Three sequential passes over every id the ledger has assigned pick up
//! work a previous run left unfinished. Each scan runs even if an earlier
//! one failed, and each id is handled independently: a failure is logged and
//! counted, and the scan moves on. Only cancellation stops recovery.

use serde::Serialize;
use tracing::{error, info, warn};

use flip_core::{EscrowCreated, MintingId, MintingStatus, RedemptionId, RedemptionStatus};

use crate::error::SettlementError;
use crate::orchestrator::{
    minting_event, AttestationOutcome, MintingOutcome, SettlementOrchestrator,
};

/// One of the startup recovery passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryScan {
    FailedAttestations,
    PendingEscrows,
    PendingMintings,
}

impl RecoveryScan {
    /// Scans in the order they run.
    pub const ALL: [RecoveryScan; 3] = [
        RecoveryScan::FailedAttestations,
        RecoveryScan::PendingEscrows,
        RecoveryScan::PendingMintings,
    ];
}

impl std::fmt::Display for RecoveryScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FailedAttestations => write!(f, "failed-attestations"),
            Self::PendingEscrows => write!(f, "pending-escrows"),
            Self::PendingMintings => write!(f, "pending-mintings"),
        }
    }
}

/// What the recovery scans found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub redemptions_scanned: u64,
    pub mintings_scanned: u64,
    /// Paid redemptions whose proof was fetched and submitted again.
    pub attestations_retried: u64,
    /// Escrows with no recorded payment that re-entered the payment step.
    pub escrows_resumed: u64,
    pub mintings_retried: u64,
    pub mintings_deferred: u64,
    /// Ids that could not be read or whose retry failed.
    pub failures: u64,
    /// Scans that could not run at all, e.g. because the id counter was
    /// unreadable.
    pub failed_scans: Vec<RecoveryScan>,
}

fn awaiting_attestation(status: RedemptionStatus) -> bool {
    matches!(
        status,
        RedemptionStatus::EscrowCreated | RedemptionStatus::AttestationQueued
    )
}

impl SettlementOrchestrator {
    /// Run the failed-attestation, pending-escrow, and pending-minting scans
    /// in that order. Must complete before [`run`](Self::run) starts.
    ///
    /// A scan that fails is recorded in [`RecoveryReport::failed_scans`] and
    /// the next scan still runs. Returns `Err` only when cancelled.
    pub async fn recover(&mut self) -> Result<RecoveryReport, SettlementError> {
        let mut report = RecoveryReport::default();
        info!("starting recovery scans");

        let mut outcome = Ok(());
        for scan in RecoveryScan::ALL {
            let result = match scan {
                RecoveryScan::FailedAttestations => self.recover_attestations(&mut report).await,
                RecoveryScan::PendingEscrows => self.recover_escrows(&mut report).await,
                RecoveryScan::PendingMintings => self.recover_mintings(&mut report).await,
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    outcome = Err(e);
                    break;
                }
                Err(e) => {
                    error!(%scan, error = %e, "recovery scan failed, continuing with the next");
                    report.failed_scans.push(scan);
                }
            }
        }

        info!(
            attestations_retried = report.attestations_retried,
            escrows_resumed = report.escrows_resumed,
            mintings_retried = report.mintings_retried,
            failures = report.failures,
            failed_scans = report.failed_scans.len(),
            "recovery scans complete"
        );
        self.stats.recovery = Some(report.clone());
        self.publish();
        outcome.map(|()| report)
    }

    /// Redemptions with a recorded payment but no accepted outcome: fetch and
    /// submit the proof again without touching the rail.
    async fn recover_attestations(
        &mut self,
        report: &mut RecoveryReport,
    ) -> Result<(), SettlementError> {
        let next = self.ledger.next_redemption_id().await?;
        info!(next_redemption_id = next, "scanning for unattested payments");

        for raw in 0..next {
            let id = RedemptionId(raw);
            report.redemptions_scanned += 1;
            let redemption = match self.ledger.redemption(id).await {
                Ok(redemption) => redemption,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(redemption_id = raw, error = %e, "failed to read redemption");
                    report.failures += 1;
                    continue;
                }
            };
            if !awaiting_attestation(redemption.status) {
                continue;
            }
            let Some(tx_hash) = redemption.recorded_payment() else {
                continue;
            };

            info!(redemption_id = raw, %tx_hash, "retrying attestation for recorded payment");
            report.attestations_retried += 1;
            self.processed.mark_escrowed(id);
            self.processed.mark_paid(id);
            match self.attest(id, tx_hash).await {
                Ok(AttestationOutcome::Submitted { .. }) => {
                    info!(redemption_id = raw, "recovered attestation");
                }
                Ok(_) => report.failures += 1,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!(redemption_id = raw, error = %e, "failed to retry attestation");
                    report.failures += 1;
                }
            }
        }
        Ok(())
    }

    /// Escrows still waiting for a payment: rebuild the event from the stored
    /// record and run the payment step.
    async fn recover_escrows(&mut self, report: &mut RecoveryReport) -> Result<(), SettlementError> {
        let next = self.ledger.next_redemption_id().await?;
        info!(next_redemption_id = next, "scanning for pending escrows");

        for raw in 0..next {
            let id = RedemptionId(raw);
            let redemption = match self.ledger.redemption(id).await {
                Ok(redemption) => redemption,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(redemption_id = raw, error = %e, "failed to read redemption");
                    report.failures += 1;
                    continue;
                }
            };
            if redemption.status != RedemptionStatus::EscrowCreated {
                continue;
            }
            if let Some(existing) = redemption.recorded_payment() {
                info!(redemption_id = raw, existing_tx_hash = %existing, "payment already recorded, skipping");
                continue;
            }

            let event = EscrowCreated::from_redemption(&redemption);
            info!(
                redemption_id = raw,
                user = %event.user,
                destination = %event.destination,
                amount = event.amount,
                "resuming pending escrow"
            );
            report.escrows_resumed += 1;
            self.processed.mark_escrowed(id);
            match self.handle_escrow_created(&event).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!(redemption_id = raw, error = %e, "failed to process pending escrow");
                    report.failures += 1;
                }
            }
        }
        Ok(())
    }

    /// Mintings still pending: retry provisional settlement.
    async fn recover_mintings(&mut self, report: &mut RecoveryReport) -> Result<(), SettlementError> {
        let next = self.ledger.next_minting_id().await?;
        info!(next_minting_id = next, "scanning for pending mintings");

        for raw in 0..next {
            let id = MintingId(raw);
            report.mintings_scanned += 1;
            let minting = match self.ledger.minting(id).await {
                Ok(minting) => minting,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(minting_id = raw, error = %e, "failed to read minting");
                    report.failures += 1;
                    continue;
                }
            };
            if minting.status != MintingStatus::Pending {
                continue;
            }

            report.mintings_retried += 1;
            match self.handle_minting_requested(&minting_event(&minting)).await {
                Ok(MintingOutcome::Deferred { .. }) => report.mintings_deferred += 1,
                Ok(_) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!(minting_id = raw, error = %e, "failed to process pending minting");
                    report.failures += 1;
                }
            }
        }
        Ok(())
    }
}
