//! Integration test: mintings wait for active provider liquidity.
//!
//! An uncovered minting is skipped, not failed, and stays pending on the
//! ledger until a later delivery or scan finds enough liquidity.

use std::time::Duration;

use flip_core::{Address, MintingStatus};
use flip_integration_tests::{wait_for_stats, Scenario};
use flip_settlement::adapters::memory::LedgerCall;
use flip_settlement::{shutdown_channel, ShutdownSignal};

const ASSET: Address = Address::repeat_byte(0x42);

#[tokio::test]
async fn test_no_providers_leaves_minting_pending() {
    let scenario = Scenario::new();
    let id = scenario
        .ledger
        .request_minting(Address::ZERO, ASSET, 250, "PAYIN", true);

    let mut orchestrator = scenario.orchestrator(ShutdownSignal::never());
    let report = orchestrator.recover().await.unwrap();

    assert_eq!(report.mintings_deferred, 1);
    assert_eq!(report.failures, 0);
    assert_eq!(orchestrator.stats().failures, 0);
    assert_eq!(
        scenario.ledger.minting_snapshot(id).unwrap().status,
        MintingStatus::Pending
    );
    assert_eq!(scenario.ledger.call_count(LedgerCall::ProcessMinting), 0);
}

#[tokio::test]
async fn test_inactive_provider_does_not_count() {
    let scenario = Scenario::new();
    scenario
        .ledger
        .set_liquidity(Address::repeat_byte(1), ASSET, 10_000, false);
    let id = scenario
        .ledger
        .request_minting(Address::ZERO, ASSET, 250, "PAYIN", true);

    let mut orchestrator = scenario.orchestrator(ShutdownSignal::never());
    orchestrator.recover().await.unwrap();
    assert_eq!(
        scenario.ledger.minting_snapshot(id).unwrap().status,
        MintingStatus::Pending
    );
}

#[tokio::test]
async fn test_live_minting_deferred_then_recovered() {
    let scenario = Scenario::new();
    let (trigger, signal) = shutdown_channel();
    let orchestrator = scenario.orchestrator(signal.clone());
    let mut stats_rx = orchestrator.subscribe_stats();
    let queues = scenario.spawn_producers(&signal);
    let handle = tokio::spawn(orchestrator.run(queues));

    let id = scenario
        .ledger
        .request_minting(Address::ZERO, ASSET, 250, "PAYIN", true);
    let stats = wait_for_stats(&mut stats_rx, |s| s.mintings_deferred == 1).await;
    assert_eq!(stats.failures, 0);
    trigger.trigger();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        scenario.ledger.minting_snapshot(id).unwrap().status,
        MintingStatus::Pending
    );

    // Liquidity arrives; the next startup scan settles the minting.
    scenario
        .ledger
        .set_liquidity(Address::repeat_byte(1), ASSET, 250, true);
    let mut restarted = scenario.orchestrator(ShutdownSignal::never());
    let report = restarted.recover().await.unwrap();
    assert_eq!(report.mintings_retried, 1);
    assert_eq!(report.mintings_deferred, 0);
    let minting = scenario.ledger.minting_snapshot(id).unwrap();
    assert_eq!(minting.status, MintingStatus::ProvisionalSettled);
    assert_eq!(minting.matched_provider, Some(Address::repeat_byte(1)));
}

#[tokio::test]
async fn test_check_disabled_defers_to_ledger() {
    let mut scenario = Scenario::new();
    scenario.config.liquidity_check = false;
    let id = scenario
        .ledger
        .request_minting(Address::ZERO, ASSET, 250, "PAYIN", true);

    let mut orchestrator = scenario.orchestrator(ShutdownSignal::never());
    let report = orchestrator.recover().await.unwrap();

    // The ledger itself refuses the unmatched minting.
    assert_eq!(report.failures, 1);
    assert_eq!(scenario.ledger.call_count(LedgerCall::ProcessMinting), 1);
    assert_eq!(
        scenario.ledger.minting_snapshot(id).unwrap().status,
        MintingStatus::Pending
    );
}
