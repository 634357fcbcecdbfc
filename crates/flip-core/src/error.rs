use crate::state_machine::SettlementStage;

/// Core protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid stage transition from {from} to {to}")]
    InvalidStateTransition {
        from: SettlementStage,
        to: SettlementStage,
    },

    #[error("unknown {kind} status code: {code}")]
    UnknownStatus { kind: &'static str, code: u8 },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
