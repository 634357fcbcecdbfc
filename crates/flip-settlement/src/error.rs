use flip_core::{CoreError, MintingId, RedemptionId};

/// Failure classes the executor reacts to differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts and connection failures; retried with a bound.
    TransientInfra,
    /// The ledger reverted or returned a non-success status.
    LedgerRejected,
    /// Insufficient balance or a rail-side rejection.
    ExternalPayment,
    /// The attestation is not ready yet; retried by the recovery scan.
    ProofUnavailable,
    /// Fatal at startup.
    Configuration,
    Cancelled,
    Internal,
}

/// Settlement-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ledger rejected {call}: {reason}")]
    LedgerRejected { call: &'static str, reason: String },

    #[error("redemption not found: {0}")]
    RedemptionNotFound(RedemptionId),

    #[error("minting not found: {0}")]
    MintingNotFound(MintingId),

    #[error("insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: u128, required: u128 },

    #[error("payment rejected by rail: {0}")]
    PaymentRejected(String),

    #[error("payment {tx_hash} not finalized after {attempts} attempts")]
    FinalizationTimeout { tx_hash: String, attempts: u32 },

    #[error("proof unavailable: {0}")]
    ProofUnavailable(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SettlementError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::Http(_) | Self::FinalizationTimeout { .. } => {
                ErrorKind::TransientInfra
            }
            Self::LedgerRejected { .. } => ErrorKind::LedgerRejected,
            Self::InsufficientBalance { .. } | Self::PaymentRejected(_) => {
                ErrorKind::ExternalPayment
            }
            Self::ProofUnavailable(_) => ErrorKind::ProofUnavailable,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::RedemptionNotFound(_)
            | Self::MintingNotFound(_)
            | Self::Core(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether an immediate bounded retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientInfra | ErrorKind::ExternalPayment | ErrorKind::ProofUnavailable
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
