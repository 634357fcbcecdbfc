//! FLIP scoring: risk gating for the settlement executor.
//!
//! This crate provides:
//! - [`DeterministicScorer`]: fixed-point scoring of a request into a [`Decision`].
//! - [`ScoringPolicy`]: the interchangeable source of the scoring tuple passed to the ledger.
//! - [`metrics`]: price volatility and agent success-rate inputs.

pub mod error;
pub mod metrics;
pub mod policy;
pub mod scorer;

pub use error::ScoringError;
pub use policy::{
    AgentProfile, DeterministicPolicy, FixedPolicy, PolicyKind, PolicyOutcome, ScoringPolicy,
};
pub use scorer::{Decision, DeterministicScorer, ScoreResult, ScorerConfig, ScoringParams};
