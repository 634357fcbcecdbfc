use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use flip_core::{MintingId, RedemptionId, SettlementStage, SettlementStateMachine, StageEvent};

/// Ids this process has already driven through a step.
///
/// Advisory only: the ledger's status and recorded hash are authoritative and
/// the set is rebuilt by the recovery scans after a restart. Owned by the
/// orchestrator and mutated only through `&mut`.
#[derive(Debug, Default)]
pub struct ProcessedSet {
    escrowed: HashSet<RedemptionId>,
    paid: HashSet<RedemptionId>,
    minted: HashSet<MintingId>,
}

impl ProcessedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_escrowed(&self, id: RedemptionId) -> bool {
        self.escrowed.contains(&id)
    }

    /// Returns `false` if the id was already marked.
    pub fn mark_escrowed(&mut self, id: RedemptionId) -> bool {
        self.escrowed.insert(id)
    }

    pub fn is_paid(&self, id: RedemptionId) -> bool {
        self.paid.contains(&id)
    }

    pub fn mark_paid(&mut self, id: RedemptionId) -> bool {
        self.paid.insert(id)
    }

    pub fn is_minted(&self, id: MintingId) -> bool {
        self.minted.contains(&id)
    }

    pub fn mark_minted(&mut self, id: MintingId) -> bool {
        self.minted.insert(id)
    }

    pub fn paid_count(&self) -> usize {
        self.paid.len()
    }
}

/// Redemptions that reached each final stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FinishedCounts {
    pub finalized: u64,
    pub failed: u64,
    pub timed_out: u64,
}

impl FinishedCounts {
    fn record(&mut self, stage: SettlementStage) {
        match stage {
            SettlementStage::Finalized => self.finalized += 1,
            SettlementStage::Failed => self.failed += 1,
            SettlementStage::TimedOut => self.timed_out += 1,
            _ => {}
        }
    }

    pub fn total(&self) -> u64 {
        self.finalized + self.failed + self.timed_out
    }
}

/// Per-redemption settlement stage as seen by this process.
///
/// Only in-flight redemptions are kept. A redemption that reaches a final
/// stage is dropped and counted in [`FinishedCounts`].
#[derive(Debug, Default)]
pub struct StageTracker {
    stages: BTreeMap<RedemptionId, SettlementStage>,
    finished: FinishedCounts,
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` for untracked ids and for ids that already finished.
    pub fn get(&self, id: RedemptionId) -> Option<SettlementStage> {
        self.stages.get(&id).copied()
    }

    /// Record a stage learned from the ledger unless one is already tracked.
    pub fn seed(&mut self, id: RedemptionId, stage: SettlementStage) {
        if self.stages.contains_key(&id) {
            return;
        }
        if stage.is_final() {
            self.finished.record(stage);
        } else {
            self.stages.insert(id, stage);
        }
    }

    /// Apply an event. Untracked ids start at `Pending`; invalid transitions
    /// leave the stage unchanged.
    pub fn advance(&mut self, id: RedemptionId, event: StageEvent) -> Option<SettlementStage> {
        let current = self.get(id).unwrap_or(SettlementStage::Pending);
        match SettlementStateMachine::transition(current, event) {
            Ok(next) if next.is_final() => {
                self.stages.remove(&id);
                self.finished.record(next);
                Some(next)
            }
            Ok(next) => {
                self.stages.insert(id, next);
                Some(next)
            }
            Err(e) => {
                tracing::debug!(redemption_id = id.0, error = %e, "stage unchanged");
                None
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.stages.len()
    }

    pub fn finished(&self) -> FinishedCounts {
        self.finished
    }

    pub fn snapshot(&self) -> BTreeMap<u64, SettlementStage> {
        self.stages.iter().map(|(id, stage)| (id.0, *stage)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_once() {
        let mut set = ProcessedSet::new();
        let id = RedemptionId(3);
        assert!(!set.is_paid(id));
        assert!(set.mark_paid(id));
        assert!(!set.mark_paid(id));
        assert!(set.is_paid(id));
        assert!(!set.is_escrowed(id));
        assert_eq!(set.paid_count(), 1);
    }

    #[test]
    fn test_sets_are_independent() {
        let mut set = ProcessedSet::new();
        set.mark_escrowed(RedemptionId(1));
        set.mark_minted(MintingId(1));
        assert!(set.is_escrowed(RedemptionId(1)));
        assert!(!set.is_paid(RedemptionId(1)));
        assert!(set.is_minted(MintingId(1)));
    }

    #[test]
    fn test_tracker_advances_and_rejects() {
        let mut tracker = StageTracker::new();
        let id = RedemptionId(9);
        assert_eq!(
            tracker.advance(id, StageEvent::EscrowCreated),
            Some(SettlementStage::EscrowCreated)
        );
        assert_eq!(tracker.advance(id, StageEvent::ProofObtained), None);
        assert_eq!(tracker.get(id), Some(SettlementStage::EscrowCreated));
    }

    #[test]
    fn test_seed_does_not_overwrite() {
        let mut tracker = StageTracker::new();
        let id = RedemptionId(2);
        tracker.seed(id, SettlementStage::PaymentSent);
        tracker.seed(id, SettlementStage::EscrowCreated);
        assert_eq!(tracker.get(id), Some(SettlementStage::PaymentSent));
        assert_eq!(tracker.snapshot().get(&2), Some(&SettlementStage::PaymentSent));
    }

    #[test]
    fn test_final_stages_are_evicted_and_counted() {
        let mut tracker = StageTracker::new();
        for raw in 0..1_000 {
            let id = RedemptionId(raw);
            tracker.advance(id, StageEvent::EscrowCreated);
            tracker.advance(id, StageEvent::PaymentSent);
            let last = match raw % 3 {
                0 => {
                    tracker.advance(id, StageEvent::ProofObtained);
                    StageEvent::OutcomeAccepted
                }
                1 => StageEvent::TimedOut,
                _ => {
                    tracker.advance(id, StageEvent::ProofObtained);
                    StageEvent::Failed
                }
            };
            assert!(tracker.advance(id, last).unwrap().is_final());
            assert_eq!(tracker.get(id), None);
        }
        tracker.advance(RedemptionId(1_000), StageEvent::EscrowCreated);

        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(tracker.snapshot().len(), 1);
        assert_eq!(
            tracker.finished(),
            FinishedCounts {
                finalized: 334,
                failed: 333,
                timed_out: 333,
            }
        );
        assert_eq!(tracker.finished().total(), 1_000);
    }

    #[test]
    fn test_seeding_a_final_stage_only_counts() {
        let mut tracker = StageTracker::new();
        tracker.seed(RedemptionId(4), SettlementStage::Finalized);
        assert_eq!(tracker.get(RedemptionId(4)), None);
        assert_eq!(tracker.finished().finalized, 1);
    }
}
