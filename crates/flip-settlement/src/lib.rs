//! FLIP settlement layer
//!
//! Watches the ledger for redemption, escrow, and minting events, pays
//! redemptions out on the external rail, proves those payments through the
//! attestation network, and provisionally settles mintings. Collaborators are
//! pluggable through the traits in [`traits`]; [`adapters`] holds the
//! in-memory, EVM, XRPL, and FDC backends.

pub mod adapters;
pub mod error;
pub mod idempotency;
pub mod liquidity;
pub mod orchestrator;
pub mod payment;
pub mod producer;
pub mod recovery;
pub mod retry;
pub mod shutdown;
pub mod traits;

pub use error::{ErrorKind, SettlementError};
pub use idempotency::{FinishedCounts, ProcessedSet, StageTracker};
pub use liquidity::{check_liquidity, LiquidityCheck};
pub use orchestrator::{AttestationOutcome, MintingOutcome, OrchestratorStats, SettlementOrchestrator};
pub use payment::PaymentDispatcher;
pub use producer::{event_channels, EventProducer, EventQueues, EventSinks, ProducerSink};
pub use recovery::{RecoveryReport, RecoveryScan};
pub use retry::{poll_until, retry, retry_if, RetryPolicy, RetryStrategy};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use traits::{ensure_success, AttestationService, ChainEventSource, LedgerClient, PaymentRail};
