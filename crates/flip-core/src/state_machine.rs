use std::fmt;

use crate::error::CoreError;

/// Executor-side lifecycle of a single redemption settlement.
///
/// This tracks how far the agent has driven a redemption, which is finer
/// grained than the ledger's own [`RedemptionStatus`](crate::types::RedemptionStatus).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SettlementStage {
    /// Redemption observed, escrow not yet created.
    Pending,
    /// Escrow exists on the ledger, rail payment outstanding.
    EscrowCreated,
    /// Rail payment submitted and its hash recorded.
    PaymentSent,
    /// Attestation proof retrieved for the payment.
    ProofObtained,
    /// Outcome accepted by the ledger. Final state.
    Finalized,
    /// Settlement abandoned or rejected. Final state.
    Failed,
    /// Escrow timed out before settlement completed. Final state.
    TimedOut,
}

impl SettlementStage {
    /// Whether this is a final (terminal) stage.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for SettlementStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::EscrowCreated => write!(f, "EscrowCreated"),
            Self::PaymentSent => write!(f, "PaymentSent"),
            Self::ProofObtained => write!(f, "ProofObtained"),
            Self::Finalized => write!(f, "Finalized"),
            Self::Failed => write!(f, "Failed"),
            Self::TimedOut => write!(f, "TimedOut"),
        }
    }
}

/// Events that drive a settlement between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    EscrowCreated,
    PaymentSent,
    ProofObtained,
    /// The ledger accepted the attestation outcome.
    OutcomeAccepted,
    /// Submitting the outcome exhausted its attempts; the payment stays
    /// sent and the proof must be fetched again.
    SubmissionExhausted,
    Failed,
    TimedOut,
}

/// Settlement stage transitions.
///
/// Valid transitions:
/// - Pending → EscrowCreated (EscrowCreated)
/// - EscrowCreated → PaymentSent (PaymentSent)
/// - PaymentSent → ProofObtained (ProofObtained)
/// - ProofObtained → Finalized (OutcomeAccepted)
/// - ProofObtained → PaymentSent (SubmissionExhausted)
/// - any non-final stage → Failed (Failed)
/// - any non-final stage → TimedOut (TimedOut)
pub struct SettlementStateMachine;

impl SettlementStateMachine {
    /// Attempt a stage transition based on an event.
    pub fn transition(
        current: SettlementStage,
        event: StageEvent,
    ) -> Result<SettlementStage, CoreError> {
        let next = match (current, event) {
            (SettlementStage::Pending, StageEvent::EscrowCreated) => SettlementStage::EscrowCreated,
            (SettlementStage::EscrowCreated, StageEvent::PaymentSent) => {
                SettlementStage::PaymentSent
            }
            (SettlementStage::PaymentSent, StageEvent::ProofObtained) => {
                SettlementStage::ProofObtained
            }
            (SettlementStage::ProofObtained, StageEvent::OutcomeAccepted) => {
                SettlementStage::Finalized
            }
            (SettlementStage::ProofObtained, StageEvent::SubmissionExhausted) => {
                SettlementStage::PaymentSent
            }

            (stage, StageEvent::Failed) if !stage.is_final() => SettlementStage::Failed,
            (stage, StageEvent::TimedOut) if !stage.is_final() => SettlementStage::TimedOut,

            _ => {
                return Err(CoreError::InvalidStateTransition {
                    from: current,
                    to: Self::target_of(event),
                });
            }
        };

        tracing::debug!(
            from = %current,
            to = %next,
            event = ?event,
            "settlement stage transition"
        );

        Ok(next)
    }

    /// Check if a transition is valid without performing it.
    pub fn can_transition(current: SettlementStage, event: StageEvent) -> bool {
        Self::transition(current, event).is_ok()
    }

    fn target_of(event: StageEvent) -> SettlementStage {
        match event {
            StageEvent::EscrowCreated => SettlementStage::EscrowCreated,
            StageEvent::PaymentSent | StageEvent::SubmissionExhausted => {
                SettlementStage::PaymentSent
            }
            StageEvent::ProofObtained => SettlementStage::ProofObtained,
            StageEvent::OutcomeAccepted => SettlementStage::Finalized,
            StageEvent::Failed => SettlementStage::Failed,
            StageEvent::TimedOut => SettlementStage::TimedOut,
        }
    }
}
