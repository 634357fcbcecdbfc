//! Integration test: each redemption is paid out on the rail exactly once.
//!
//! Drives the producers, the orchestrator loop, and the recovery scan
//! against one shared in-memory ledger and rail.

use std::time::Duration;

use flip_core::{EscrowCreated, RedemptionStatus};
use flip_integration_tests::{wait_for_stats, Scenario};
use flip_settlement::{event_channels, shutdown_channel, ShutdownSignal};

// =========================================================================
// Live pipeline
// =========================================================================

#[tokio::test]
async fn test_live_pipeline_pays_each_redemption_once() {
    let scenario = Scenario::new();
    let (trigger, signal) = shutdown_channel();
    let orchestrator = scenario.orchestrator(signal.clone());
    let queues = scenario.spawn_producers(&signal);
    let handle = tokio::spawn(orchestrator.run(queues));

    let ids = vec![
        scenario.redeem(1_000, "rAlice"),
        scenario.redeem(2_000, "rBob"),
        scenario.redeem(3_000, "rCarol"),
    ];
    scenario
        .wait_for_status(&ids, RedemptionStatus::Finalized, Duration::from_secs(5))
        .await;
    trigger.trigger();
    let stats = handle.await.unwrap();

    assert_eq!(scenario.rail.sent_count(), 3);
    assert_eq!(stats.payments_sent, 3);
    assert_eq!(stats.proofs_submitted, 3);
    assert_eq!(scenario.rail.payments_to("rBob")[0].amount, 2_000);
}

#[tokio::test]
async fn test_duplicate_queue_delivery_pays_once() {
    let scenario = Scenario::new();
    let id = scenario.redeem(5_000, "rDest");
    let mut orchestrator = scenario.orchestrator(ShutdownSignal::never());
    let requested = flip_core::RedemptionRequested {
        redemption_id: id,
        user: flip_core::Address::repeat_byte(1),
        asset: flip_core::Address::repeat_byte(2),
        amount: 5_000,
        destination: "rDest".into(),
    };
    orchestrator.handle_redemption_requested(&requested).await.unwrap();

    let (trigger, signal) = shutdown_channel();
    let orchestrator = scenario.orchestrator(signal);
    let mut stats_rx = orchestrator.subscribe_stats();
    let (sinks, queues) = event_channels(4);
    let escrow = EscrowCreated::from_redemption(&scenario.ledger.redemption_snapshot(id).unwrap());
    sinks.escrows.send(escrow.clone()).await.unwrap();
    sinks.escrows.send(escrow).await.unwrap();

    let handle = tokio::spawn(orchestrator.run(queues));
    wait_for_stats(&mut stats_rx, |s| s.proofs_submitted == 1).await;
    trigger.trigger();
    handle.await.unwrap();

    assert_eq!(scenario.rail.sent_count(), 1);
    assert_eq!(scenario.status(id), Some(RedemptionStatus::Finalized));
}

// =========================================================================
// Live delivery followed by a recovery pass
// =========================================================================

#[tokio::test]
async fn test_recovery_after_live_payment_does_not_pay_again() {
    let scenario = Scenario::new();
    let id = scenario.redeem(4_000, "rDest");
    let mut live = scenario.orchestrator(ShutdownSignal::never());
    let requested = flip_core::RedemptionRequested {
        redemption_id: id,
        user: flip_core::Address::repeat_byte(1),
        asset: flip_core::Address::repeat_byte(2),
        amount: 4_000,
        destination: "rDest".into(),
    };
    live.handle_redemption_requested(&requested).await.unwrap();

    // Proof not ready yet: payment recorded, redemption still escrowed.
    scenario.attestation.withhold_next(1);
    let escrow = EscrowCreated::from_redemption(&scenario.ledger.redemption_snapshot(id).unwrap());
    live.handle_escrow_created(&escrow).await.unwrap();
    assert_eq!(scenario.status(id), Some(RedemptionStatus::EscrowCreated));

    // The same escrow delivered again, then a recovery pass.
    live.handle_escrow_created(&escrow).await.unwrap();
    let report = live.recover().await.unwrap();

    assert_eq!(report.attestations_retried, 1);
    assert_eq!(report.escrows_resumed, 0);
    assert_eq!(scenario.rail.sent_count(), 1);
    assert_eq!(scenario.status(id), Some(RedemptionStatus::Finalized));
}
