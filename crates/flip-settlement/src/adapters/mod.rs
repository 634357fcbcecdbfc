//! Ledger, rail, and attestation backends.
//!
//! `memory` backs tests and dry runs; `evm`, `xrpl`, and `fdc` talk to live
//! services over JSON-RPC and HTTP.

pub mod evm;
pub mod fdc;
pub mod memory;
pub mod xrpl;

pub use evm::{EvmLedger, EvmLedgerConfig};
pub use fdc::{FdcAttestationService, FdcConfig};
pub use memory::{MemoryAttestation, MemoryLedger, MemoryRail};
pub use xrpl::{XrplRail, XrplRailConfig};
