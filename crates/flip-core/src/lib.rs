pub mod amount_serde;
pub mod config;
pub mod error;
pub mod state_machine;
pub mod types;

pub use config::SettlementConfig;
pub use error::CoreError;
pub use state_machine::{SettlementStage, SettlementStateMachine, StageEvent};
pub use types::{
    clean_destination, Address, AttestationProof, EscrowCreated, EscrowLog, EventKind,
    LedgerEvent, LedgerLog, LedgerScoringArgs, LiquidityPosition, Minting, MintingId,
    MintingRequested, MintingStatus, PaymentReference, Redemption, RedemptionId,
    RedemptionRequested, RedemptionStatus, TxReceipt, SCALE,
};
