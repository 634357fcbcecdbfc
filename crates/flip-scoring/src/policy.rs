use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use flip_core::{LedgerScoringArgs, Minting, Redemption};

use crate::error::ScoringError;
use crate::metrics;
use crate::scorer::{DeterministicScorer, ScoreResult, ScoringParams};

const ONE_ETHER: u128 = 1_000_000_000_000_000_000;

/// Which policy supplies the scoring tuple passed to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Fixed,
    Deterministic,
}

impl FromStr for PolicyKind {
    type Err = ScoringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "deterministic" => Ok(Self::Deterministic),
            other => Err(ScoringError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Constant high-confidence tuples used by the fixed policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPolicy {
    #[serde(default = "default_fixed_volatility", with = "flip_core::amount_serde")]
    pub redemption_volatility: u128,
    #[serde(default = "default_fixed_success_rate", with = "flip_core::amount_serde")]
    pub agent_success_rate: u128,
    #[serde(default = "default_fixed_stake", with = "flip_core::amount_serde")]
    pub agent_stake: u128,
    #[serde(default = "default_fixed_volatility", with = "flip_core::amount_serde")]
    pub minting_volatility: u128,
}

fn default_fixed_volatility() -> u128 {
    10_000
}
fn default_fixed_success_rate() -> u128 {
    990_000
}
fn default_fixed_stake() -> u128 {
    200_000 * ONE_ETHER
}

impl Default for FixedPolicy {
    fn default() -> Self {
        Self {
            redemption_volatility: default_fixed_volatility(),
            agent_success_rate: default_fixed_success_rate(),
            agent_stake: default_fixed_stake(),
            minting_volatility: default_fixed_volatility(),
        }
    }
}

/// The executing agent's reputation, fed to the scorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    #[serde(default)]
    pub completed_settlements: u64,
    #[serde(default)]
    pub total_settlements: u64,
    #[serde(default = "default_fixed_stake", with = "flip_core::amount_serde")]
    pub stake: u128,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            completed_settlements: 0,
            total_settlements: 0,
            stake: default_fixed_stake(),
        }
    }
}

impl AgentProfile {
    pub fn success_rate(&self) -> u128 {
        metrics::agent_success_rate(self.completed_settlements, self.total_settlements)
    }
}

/// Policy that evaluates the [`DeterministicScorer`] for each request.
///
/// Clones share the current volatility, so a price feed holding one clone can
/// update it while the orchestrator keeps scoring with another. With no feed
/// it stays at the initial value.
#[derive(Debug, Clone)]
pub struct DeterministicPolicy {
    scorer: DeterministicScorer,
    profile: AgentProfile,
    volatility: Arc<AtomicU64>,
    clock: fn() -> u32,
}

fn utc_hour() -> u32 {
    chrono::Utc::now().hour()
}

impl DeterministicPolicy {
    pub fn new(scorer: DeterministicScorer, profile: AgentProfile, initial_volatility: u64) -> Self {
        Self {
            scorer,
            profile,
            volatility: Arc::new(AtomicU64::new(initial_volatility)),
            clock: utc_hour,
        }
    }

    /// Replace the hour-of-day source.
    pub fn with_clock(mut self, clock: fn() -> u32) -> Self {
        self.clock = clock;
        self
    }

    pub fn volatility(&self) -> u128 {
        self.volatility.load(Ordering::Relaxed) as u128
    }

    pub fn set_volatility(&self, volatility: u64) {
        self.volatility.store(volatility, Ordering::Relaxed);
    }

    /// Recompute volatility from a window of recent prices.
    pub fn observe_prices(&self, prices: &[u128]) -> u128 {
        let volatility = metrics::price_volatility(prices);
        self.set_volatility(u64::try_from(volatility).unwrap_or(u64::MAX));
        volatility
    }

    fn params(&self, amount: u128) -> ScoringParams {
        ScoringParams {
            price_volatility: self.volatility(),
            amount,
            agent_success_rate: self.profile.success_rate(),
            agent_stake: self.profile.stake,
            hour_of_day: (self.clock)(),
        }
    }
}

/// Tuple to pass to the ledger, with the score that produced it when one was
/// computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub args: LedgerScoringArgs,
    pub score: Option<ScoreResult>,
}

/// Interchangeable source of ledger scoring tuples.
#[derive(Debug, Clone)]
pub enum ScoringPolicy {
    Fixed(FixedPolicy),
    Deterministic(DeterministicPolicy),
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self::Fixed(FixedPolicy::default())
    }
}

impl ScoringPolicy {
    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::Fixed(_) => PolicyKind::Fixed,
            Self::Deterministic(_) => PolicyKind::Deterministic,
        }
    }

    /// Scoring tuple for a redemption's processing call.
    pub fn for_redemption(&self, redemption: &Redemption) -> PolicyOutcome {
        match self {
            Self::Fixed(fixed) => PolicyOutcome {
                args: LedgerScoringArgs {
                    price_volatility: fixed.redemption_volatility,
                    agent_success_rate: fixed.agent_success_rate,
                    agent_stake: fixed.agent_stake,
                },
                score: None,
            },
            Self::Deterministic(policy) => {
                let params = policy.params(redemption.amount);
                let result = policy.scorer.score(&params);
                tracing::info!(
                    redemption_id = redemption.id.0,
                    score = result.score,
                    confidence_lower = result.confidence_lower,
                    decision = %result.decision,
                    "scored redemption"
                );
                PolicyOutcome {
                    args: LedgerScoringArgs {
                        price_volatility: params.price_volatility,
                        agent_success_rate: params.agent_success_rate,
                        agent_stake: params.agent_stake,
                    },
                    score: Some(result),
                }
            }
        }
    }

    /// Volatility argument for a minting's processing call.
    pub fn for_minting(&self, minting: &Minting) -> u128 {
        match self {
            Self::Fixed(fixed) => fixed.minting_volatility,
            Self::Deterministic(policy) => {
                let volatility = policy.volatility();
                tracing::debug!(minting_id = minting.id.0, volatility, "minting volatility");
                volatility
            }
        }
    }
}

impl Default for DeterministicPolicy {
    fn default() -> Self {
        Self::new(DeterministicScorer::default(), AgentProfile::default(), 0)
    }
}
