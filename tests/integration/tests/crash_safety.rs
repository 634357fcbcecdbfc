//! Integration test: a restart between payout and proof submission.
//!
//! The ledger's recorded payment hash is the only state that survives a
//! restart; recovery must finish attestation from it without touching the
//! rail again.

use flip_core::{EscrowCreated, RedemptionId, RedemptionRequested, RedemptionStatus};
use flip_integration_tests::Scenario;
use flip_settlement::adapters::memory::{Fault, LedgerCall};
use flip_settlement::{AttestationOutcome, SettlementOrchestrator, ShutdownSignal};

/// Drive a redemption through escrow and payout on `orchestrator`.
async fn pay(scenario: &Scenario, orchestrator: &mut SettlementOrchestrator, id: RedemptionId) {
    let r = scenario.ledger.redemption_snapshot(id).unwrap();
    orchestrator
        .handle_redemption_requested(&RedemptionRequested {
            redemption_id: id,
            user: r.user,
            asset: r.asset,
            amount: r.amount,
            destination: r.destination.clone(),
        })
        .await
        .unwrap();
    let escrow = EscrowCreated::from_redemption(&scenario.ledger.redemption_snapshot(id).unwrap());
    orchestrator.handle_escrow_created(&escrow).await.unwrap();
}

#[tokio::test]
async fn test_restart_before_proof_submission() {
    let scenario = Scenario::new();
    let id = scenario.redeem(7_500, "rDest");

    {
        let mut before_crash = scenario.orchestrator(ShutdownSignal::never());
        scenario.attestation.withhold_next(1);
        pay(&scenario, &mut before_crash, id).await;
    }
    let recorded = scenario.ledger.redemption_snapshot(id).unwrap();
    assert_eq!(recorded.status, RedemptionStatus::EscrowCreated);
    let tx_hash = recorded.recorded_payment().unwrap().to_string();
    assert_eq!(scenario.rail.sent_count(), 1);

    let mut after_restart = scenario.orchestrator(ShutdownSignal::never());
    let report = after_restart.recover().await.unwrap();

    assert_eq!(report.attestations_retried, 1);
    assert_eq!(report.escrows_resumed, 0);
    assert_eq!(report.failures, 0);
    assert_eq!(scenario.rail.sent_count(), 1);
    assert_eq!(scenario.attestation.request_count(), 2);
    let finalized = scenario.ledger.redemption_snapshot(id).unwrap();
    assert_eq!(finalized.status, RedemptionStatus::Finalized);
    assert_eq!(finalized.recorded_payment(), Some(tx_hash.as_str()));
    assert!(after_restart.processed().is_paid(id));
}

#[tokio::test]
async fn test_restart_after_submission_exhausted() {
    let scenario = Scenario::new();
    let id = scenario.redeem(1_200, "rDest");

    {
        let mut before_crash = scenario.orchestrator(ShutdownSignal::never());
        scenario
            .ledger
            .inject_fault(LedgerCall::SubmitAttestation, Fault::Revert, scenario.config.proof_submit_attempts);
        pay(&scenario, &mut before_crash, id).await;
        assert_eq!(before_crash.stats().failures, 1);
    }
    assert_eq!(scenario.status(id), Some(RedemptionStatus::EscrowCreated));

    let mut after_restart = scenario.orchestrator(ShutdownSignal::never());
    let report = after_restart.recover().await.unwrap();
    assert_eq!(report.attestations_retried, 1);
    assert_eq!(scenario.status(id), Some(RedemptionStatus::Finalized));
    assert_eq!(scenario.rail.sent_count(), 1);
}

#[tokio::test]
async fn test_repeated_restarts_while_proof_unavailable() {
    let scenario = Scenario::new();
    let id = scenario.redeem(900, "rDest");

    {
        let mut first = scenario.orchestrator(ShutdownSignal::never());
        scenario.attestation.withhold_next(3);
        pay(&scenario, &mut first, id).await;
    }

    for _ in 0..2 {
        let mut restarted = scenario.orchestrator(ShutdownSignal::never());
        let report = restarted.recover().await.unwrap();
        assert_eq!(report.attestations_retried, 1);
        assert_eq!(report.failures, 1);
        assert_eq!(scenario.status(id), Some(RedemptionStatus::EscrowCreated));
    }

    let mut last = scenario.orchestrator(ShutdownSignal::never());
    let hash = scenario.ledger.redemption_snapshot(id).unwrap().recorded_payment().unwrap().to_string();
    assert_eq!(
        last.attest(id, &hash).await.unwrap(),
        AttestationOutcome::Submitted { success: true }
    );
    assert_eq!(scenario.rail.sent_count(), 1);
}
