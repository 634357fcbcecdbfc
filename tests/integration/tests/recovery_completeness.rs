//! Integration test: the startup scans touch exactly the ids their
//! predicates select.

use flip_core::{
    Address, MintingStatus, PaymentReference, Redemption, RedemptionId, RedemptionStatus,
};
use flip_integration_tests::Scenario;
use flip_settlement::adapters::memory::LedgerCall;
use flip_settlement::{LedgerClient, PaymentRail, ShutdownSignal};

fn stored(id: u64, status: RedemptionStatus, hash: Option<String>) -> Redemption {
    Redemption {
        id: RedemptionId(id),
        user: Address::repeat_byte(1),
        asset: Address::repeat_byte(2),
        amount: 10_000 + id as u128,
        destination: format!("rUser{}\0\0", id),
        status,
        payment_tx_hash: hash,
        requested_at: 1_700_000_000,
        attestation_request_id: None,
        provisional_settled: false,
    }
}

/// Pay `destination` directly on the rail, as a crashed run would have.
async fn prior_payment(scenario: &Scenario, id: u64) -> String {
    scenario
        .rail
        .submit_payment(
            &format!("rUser{}", id),
            10_000 + id as u128,
            &PaymentReference::placeholder(RedemptionId(id)),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_mixed_redemptions() {
    let scenario = Scenario::new();

    // 0, 1: paid and recorded, waiting for attestation.
    for id in [0, 1] {
        let hash = prior_payment(&scenario, id).await;
        scenario
            .ledger
            .insert_redemption(stored(id, RedemptionStatus::EscrowCreated, Some(hash)));
    }
    // 2: paid, recorded, and queued for attestation.
    let hash = prior_payment(&scenario, 2).await;
    scenario
        .ledger
        .insert_redemption(stored(2, RedemptionStatus::AttestationQueued, Some(hash)));
    // 3, 4: escrowed, never paid. An empty recorded hash counts as absent.
    scenario
        .ledger
        .insert_redemption(stored(3, RedemptionStatus::EscrowCreated, None));
    scenario
        .ledger
        .insert_redemption(stored(4, RedemptionStatus::EscrowCreated, Some(String::new())));
    // 5, 6: settled. 7: not yet escrowed.
    scenario
        .ledger
        .insert_redemption(stored(5, RedemptionStatus::Finalized, Some("OLD5".into())));
    scenario
        .ledger
        .insert_redemption(stored(6, RedemptionStatus::Failed, Some("OLD6".into())));
    scenario
        .ledger
        .insert_redemption(stored(7, RedemptionStatus::Pending, None));
    let prior_sends = scenario.rail.sent_count();

    let mut orchestrator = scenario.orchestrator(ShutdownSignal::never());
    let report = orchestrator.recover().await.unwrap();

    assert_eq!(report.redemptions_scanned, 8);
    assert_eq!(report.attestations_retried, 3);
    assert_eq!(report.escrows_resumed, 2);
    assert_eq!(report.failures, 0);

    // Only the two unpaid escrows reached the rail.
    assert_eq!(scenario.rail.sent_count(), prior_sends + 2);
    assert_eq!(scenario.rail.payments_to("rUser3").len(), 1);
    assert_eq!(scenario.rail.payments_to("rUser4").len(), 1);
    assert_eq!(scenario.rail.payments_to("rUser0").len(), 1);

    for id in 0..5 {
        assert_eq!(
            scenario.status(RedemptionId(id)),
            Some(RedemptionStatus::Finalized),
            "redemption {} should be finalized",
            id
        );
    }
    assert_eq!(
        scenario.ledger.redemption_snapshot(RedemptionId(5)).unwrap(),
        stored(5, RedemptionStatus::Finalized, Some("OLD5".into()))
    );
    assert_eq!(scenario.status(RedemptionId(6)), Some(RedemptionStatus::Failed));
    assert_eq!(scenario.status(RedemptionId(7)), Some(RedemptionStatus::Pending));
    assert_eq!(scenario.ledger.call_count(LedgerCall::SubmitAttestation), 5);
    assert_eq!(scenario.ledger.call_count(LedgerCall::ProcessRedemption), 0);
}

#[tokio::test]
async fn test_mixed_mintings() {
    let scenario = Scenario::new();
    let asset = Address::repeat_byte(9);
    scenario
        .ledger
        .set_liquidity(Address::repeat_byte(4), asset, 1_000, true);

    let covered = scenario
        .ledger
        .request_minting(Address::ZERO, asset, 400, "PAYIN0", true);
    let settled = scenario
        .ledger
        .request_minting(Address::ZERO, asset, 100, "PAYIN1", false);
    scenario.ledger.process_minting(settled, 0).await.unwrap();
    let uncovered = scenario
        .ledger
        .request_minting(Address::ZERO, asset, 5_000, "PAYIN2", true);

    let mut orchestrator = scenario.orchestrator(ShutdownSignal::never());
    let report = orchestrator.recover().await.unwrap();

    assert_eq!(report.mintings_scanned, 3);
    assert_eq!(report.mintings_retried, 2);
    assert_eq!(report.mintings_deferred, 1);
    assert_eq!(
        scenario.ledger.minting_snapshot(covered).unwrap().status,
        MintingStatus::ProvisionalSettled
    );
    assert_eq!(
        scenario.ledger.minting_snapshot(settled).unwrap().status,
        MintingStatus::ProvisionalSettled
    );
    assert_eq!(
        scenario.ledger.minting_snapshot(uncovered).unwrap().status,
        MintingStatus::Pending
    );
    // One direct call above plus the covered minting.
    assert_eq!(scenario.ledger.call_count(LedgerCall::ProcessMinting), 2);
}

#[tokio::test]
async fn test_stats_carry_the_report() {
    let scenario = Scenario::new();
    scenario
        .ledger
        .insert_redemption(stored(0, RedemptionStatus::EscrowCreated, None));
    let mut orchestrator = scenario.orchestrator(ShutdownSignal::never());
    let stats_rx = orchestrator.subscribe_stats();
    let report = orchestrator.recover().await.unwrap();

    let published = (*stats_rx.borrow()).clone();
    assert_eq!(published.recovery, Some(report));
    assert_eq!(published.payments_sent, 1);
}
