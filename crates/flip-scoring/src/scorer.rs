use serde::{Deserialize, Serialize};

use flip_core::SCALE;

use crate::error::ScoringError;

const ONE_ETHER: u128 = 1_000_000_000_000_000_000;

/// Floor of the stability multiplier (0.8x).
const STABILITY_MIN: u128 = 800_000;
/// Ceiling of the stability multiplier (1.2x).
const STABILITY_MAX: u128 = 1_200_000;
const STABILITY_SPAN: u128 = STABILITY_MAX - STABILITY_MIN;

const AMOUNT_SMALL_MULT: u128 = 1_100_000;
const AMOUNT_LARGE_MULT: u128 = 900_000;
const AMOUNT_STEP: u128 = 100_000;

const TIME_LOW_ACTIVITY: u128 = 950_000;
const TIME_NORMAL: u128 = 1_000_000;
const TIME_PEAK: u128 = 1_050_000;

const AGENT_BASE: u128 = 850_000;
const AGENT_SPAN: u128 = 150_000;
const AGENT_MAX_STAKE_BONUS: u128 = 150_000;
const AGENT_MAX: u128 = 1_150_000;

/// Confidence-lower bound at or above which a request may be buffered.
const BUFFER_THRESHOLD: u128 = 950_000;

/// Tunable parameters of the [`DeterministicScorer`].
///
/// All ratios use the `1_000_000 = 100%` fixed-point scale; amounts and stake
/// are in 18-decimal base units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScorerConfig {
    #[serde(default = "default_base_success_rate", with = "flip_core::amount_serde")]
    pub base_success_rate: u128,
    /// Volatility at which the stability multiplier bottoms out.
    #[serde(default = "default_max_volatility", with = "flip_core::amount_serde")]
    pub max_volatility: u128,
    #[serde(default = "default_small_amount", with = "flip_core::amount_serde")]
    pub small_amount_threshold: u128,
    #[serde(default = "default_medium_amount", with = "flip_core::amount_serde")]
    pub medium_amount_threshold: u128,
    #[serde(default = "default_large_amount", with = "flip_core::amount_serde")]
    pub large_amount_threshold: u128,
    /// Stake needed for a provisional settlement and for any stake bonus.
    #[serde(default = "default_min_stake", with = "flip_core::amount_serde")]
    pub min_stake: u128,
    #[serde(default = "default_provisional_threshold", with = "flip_core::amount_serde")]
    pub provisional_threshold: u128,
    /// Volatility must be strictly below this for a provisional settlement.
    #[serde(default = "default_provisional_max_volatility", with = "flip_core::amount_serde")]
    pub provisional_max_volatility: u128,
}

fn default_base_success_rate() -> u128 {
    980_000
}
fn default_max_volatility() -> u128 {
    50_000
}
fn default_small_amount() -> u128 {
    1_000 * ONE_ETHER
}
fn default_medium_amount() -> u128 {
    10_000 * ONE_ETHER
}
fn default_large_amount() -> u128 {
    100_000 * ONE_ETHER
}
fn default_min_stake() -> u128 {
    100_000 * ONE_ETHER
}
fn default_provisional_threshold() -> u128 {
    997_000
}
fn default_provisional_max_volatility() -> u128 {
    20_000
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            base_success_rate: default_base_success_rate(),
            max_volatility: default_max_volatility(),
            small_amount_threshold: default_small_amount(),
            medium_amount_threshold: default_medium_amount(),
            large_amount_threshold: default_large_amount(),
            min_stake: default_min_stake(),
            provisional_threshold: default_provisional_threshold(),
            provisional_max_volatility: default_provisional_max_volatility(),
        }
    }
}

impl ScorerConfig {
    /// Check the invariants the multiplier formulas divide by.
    pub fn validate(&self) -> Result<(), ScoringError> {
        if self.max_volatility == 0 {
            return Err(ScoringError::InvalidConfig(
                "max_volatility must be greater than zero".into(),
            ));
        }
        if self.min_stake == 0 {
            return Err(ScoringError::InvalidConfig(
                "min_stake must be greater than zero".into(),
            ));
        }
        if !(self.small_amount_threshold < self.medium_amount_threshold
            && self.medium_amount_threshold < self.large_amount_threshold)
        {
            return Err(ScoringError::InvalidConfig(format!(
                "amount tiers must be strictly increasing: {} < {} < {}",
                self.small_amount_threshold,
                self.medium_amount_threshold,
                self.large_amount_threshold
            )));
        }
        if self.base_success_rate > SCALE {
            return Err(ScoringError::InvalidConfig(format!(
                "base_success_rate {} exceeds scale {}",
                self.base_success_rate, SCALE
            )));
        }
        Ok(())
    }
}

/// Inputs to a single scoring evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringParams {
    pub price_volatility: u128,
    pub amount: u128,
    pub agent_success_rate: u128,
    pub agent_stake: u128,
    /// Hour of day in UTC, 0..=23.
    pub hour_of_day: u32,
}

/// Routing decision for a scored request.
///
/// Discriminants match the ledger's decision codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    /// Full attestation wait, no shortcut.
    QueueFdc,
    /// Earmark buffer liquidity while the attestation is pending.
    BufferEarmark,
    /// Settle immediately, attest afterwards.
    ProvisionalSettle,
}

impl Decision {
    pub fn code(&self) -> u8 {
        match self {
            Self::QueueFdc => 0,
            Self::BufferEarmark => 1,
            Self::ProvisionalSettle => 2,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFdc => write!(f, "QueueFDC"),
            Self::BufferEarmark => write!(f, "BufferEarmark"),
            Self::ProvisionalSettle => write!(f, "ProvisionalSettle"),
        }
    }
}

/// Output of [`DeterministicScorer::score`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub score: u128,
    pub confidence_lower: u128,
    pub confidence_upper: u128,
    pub can_provisional_settle: bool,
    pub decision: Decision,
}

/// Fixed-point risk scorer.
///
/// The score is `base × stability × amount × time × agent`, each product
/// truncated back to scale before the next, capped at 100%. The result depends
/// on nothing but the parameters and the configuration.
#[derive(Debug, Clone)]
pub struct DeterministicScorer {
    config: ScorerConfig,
}

impl DeterministicScorer {
    pub fn new(config: ScorerConfig) -> Result<Self, ScoringError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    pub fn score(&self, params: &ScoringParams) -> ScoreResult {
        let mut score = self.config.base_success_rate;
        for multiplier in [
            self.stability_multiplier(params.price_volatility),
            self.amount_multiplier(params.amount),
            Self::time_multiplier(params.hour_of_day),
            self.agent_multiplier(params.agent_success_rate, params.agent_stake),
        ] {
            score = score.saturating_mul(multiplier) / SCALE;
        }
        let score = score.min(SCALE);

        let confidence_lower = score * 98 / 100;
        let confidence_upper = (score * 102 / 100).min(SCALE);

        let can_provisional_settle = confidence_lower >= self.config.provisional_threshold
            && params.price_volatility < self.config.provisional_max_volatility
            && params.amount < self.config.medium_amount_threshold
            && params.agent_stake >= self.config.min_stake;

        let decision = if can_provisional_settle {
            Decision::ProvisionalSettle
        } else if confidence_lower >= BUFFER_THRESHOLD {
            Decision::BufferEarmark
        } else {
            Decision::QueueFdc
        };

        ScoreResult {
            score,
            confidence_lower,
            confidence_upper,
            can_provisional_settle,
            decision,
        }
    }

    /// 1.2x at zero volatility falling linearly to 0.8x at `max_volatility`.
    pub fn stability_multiplier(&self, volatility: u128) -> u128 {
        if volatility >= self.config.max_volatility {
            return STABILITY_MIN;
        }
        let factor = volatility * STABILITY_SPAN / self.config.max_volatility;
        STABILITY_MAX
            .saturating_sub(factor)
            .clamp(STABILITY_MIN, STABILITY_MAX)
    }

    /// 1.1x below the small tier, 1.0x at medium, 0.9x at and beyond large.
    pub fn amount_multiplier(&self, amount: u128) -> u128 {
        let small = self.config.small_amount_threshold;
        let medium = self.config.medium_amount_threshold;
        let large = self.config.large_amount_threshold;

        if amount < small {
            AMOUNT_SMALL_MULT
        } else if amount < medium {
            let reduction = (amount - small).saturating_mul(AMOUNT_STEP) / (medium - small);
            AMOUNT_SMALL_MULT - reduction
        } else {
            let range = large - medium;
            let excess = amount - medium;
            if excess >= range {
                return AMOUNT_LARGE_MULT;
            }
            TIME_NORMAL - excess.saturating_mul(AMOUNT_STEP) / range
        }
    }

    /// Fixed lookup by UTC hour.
    pub fn time_multiplier(hour: u32) -> u128 {
        match hour {
            2..=5 => TIME_LOW_ACTIVITY,
            9..=11 | 14..=16 => TIME_PEAK,
            _ => TIME_NORMAL,
        }
    }

    /// 0.85x plus up to 0.15x for success rate, plus up to 0.15x for stake
    /// above the minimum, capped at 1.15x.
    pub fn agent_multiplier(&self, success_rate: u128, stake: u128) -> u128 {
        let base = AGENT_BASE + success_rate.saturating_mul(AGENT_SPAN) / SCALE;

        let min_stake = self.config.min_stake;
        let stake_bonus = if stake >= min_stake {
            let excess = stake - min_stake;
            if excess >= min_stake {
                AGENT_MAX_STAKE_BONUS
            } else {
                excess * AGENT_MAX_STAKE_BONUS / min_stake
            }
        } else {
            0
        };

        base.saturating_add(stake_bonus).min(AGENT_MAX)
    }
}

impl Default for DeterministicScorer {
    fn default() -> Self {
        Self {
            config: ScorerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ScoringParams {
        ScoringParams {
            price_volatility: 10_000,
            amount: 500 * ONE_ETHER,
            agent_success_rate: 990_000,
            agent_stake: 200_000 * ONE_ETHER,
            hour_of_day: 12,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ScorerConfig::default().validate().is_ok());
        assert_eq!(ScorerConfig::default().medium_amount_threshold, 10_000 * ONE_ETHER);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ScorerConfig {
            max_volatility: 0,
            ..ScorerConfig::default()
        };
        assert!(DeterministicScorer::new(config).is_err());

        let config = ScorerConfig {
            medium_amount_threshold: 1,
            ..ScorerConfig::default()
        };
        assert!(matches!(
            DeterministicScorer::new(config),
            Err(ScoringError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_known_score() {
        let scorer = DeterministicScorer::default();
        let p = ScoringParams {
            price_volatility: 25_000,
            amount: 10_000 * ONE_ETHER,
            agent_success_rate: 0,
            agent_stake: 0,
            hour_of_day: 3,
        };
        // 980000 * 1.0 = 980000; * 1.0 = 980000; * 0.95 = 931000; * 0.85 = 791350
        let result = scorer.score(&p);
        assert_eq!(result.score, 791_350);
        assert_eq!(result.confidence_lower, 775_523);
        assert_eq!(result.confidence_upper, 807_177);
        assert_eq!(result.decision, Decision::QueueFdc);
        assert!(!result.can_provisional_settle);
    }

    #[test]
    fn test_score_capped_at_scale() {
        let scorer = DeterministicScorer::default();
        let result = scorer.score(&params());
        assert_eq!(result.score, SCALE);
        assert_eq!(result.confidence_lower, 980_000);
        assert_eq!(result.confidence_upper, SCALE);
        // 980000 < 997000 so the default configuration can only buffer.
        assert_eq!(result.decision, Decision::BufferEarmark);
    }

    #[test]
    fn test_determinism() {
        let scorer = DeterministicScorer::default();
        let p = ScoringParams {
            price_volatility: 33_333,
            amount: 42_000 * ONE_ETHER + 7,
            agent_success_rate: 912_345,
            agent_stake: 150_000 * ONE_ETHER,
            hour_of_day: 22,
        };
        let first = scorer.score(&p);
        for _ in 0..100 {
            assert_eq!(scorer.score(&p), first);
        }
    }

    #[test]
    fn test_provisional_threshold_boundary() {
        let base = DeterministicScorer::default().score(&ScoringParams {
            price_volatility: 19_999,
            amount: 10_000 * ONE_ETHER - 1,
            agent_stake: 100_000 * ONE_ETHER,
            ..params()
        });

        let at = DeterministicScorer::new(ScorerConfig {
            provisional_threshold: base.confidence_lower,
            ..ScorerConfig::default()
        })
        .unwrap();
        let p = ScoringParams {
            price_volatility: 19_999,
            amount: 10_000 * ONE_ETHER - 1,
            agent_stake: 100_000 * ONE_ETHER,
            ..params()
        };
        let result = at.score(&p);
        assert!(result.can_provisional_settle);
        assert_eq!(result.decision, Decision::ProvisionalSettle);

        let above = DeterministicScorer::new(ScorerConfig {
            provisional_threshold: base.confidence_lower + 1,
            ..ScorerConfig::default()
        })
        .unwrap();
        let result = above.score(&p);
        assert!(!result.can_provisional_settle);
        assert_eq!(result.decision, Decision::BufferEarmark);
    }

    #[test]
    fn test_buffer_threshold_boundary() {
        // Every multiplier is exactly 1.0x, so the score is the base rate.
        let neutral = ScoringParams {
            price_volatility: 25_000,
            amount: 10_000 * ONE_ETHER,
            agent_success_rate: SCALE,
            agent_stake: 0,
            hour_of_day: 12,
        };
        let scorer = |base_success_rate| {
            DeterministicScorer::new(ScorerConfig {
                base_success_rate,
                ..ScorerConfig::default()
            })
            .unwrap()
        };

        // 969_388 * 98 / 100 = 950_000
        let at = scorer(969_388).score(&neutral);
        assert_eq!(at.score, 969_388);
        assert_eq!(at.confidence_lower, BUFFER_THRESHOLD);
        assert!(!at.can_provisional_settle);
        assert_eq!(at.decision, Decision::BufferEarmark);

        let below = scorer(969_387).score(&neutral);
        assert_eq!(below.confidence_lower, BUFFER_THRESHOLD - 1);
        assert_eq!(below.decision, Decision::QueueFdc);
    }

    #[test]
    fn test_provisional_requires_every_gate() {
        let scorer = DeterministicScorer::new(ScorerConfig {
            provisional_threshold: 900_000,
            ..ScorerConfig::default()
        })
        .unwrap();
        assert_eq!(scorer.score(&params()).decision, Decision::ProvisionalSettle);

        let volatile = ScoringParams {
            price_volatility: 20_000,
            ..params()
        };
        assert!(!scorer.score(&volatile).can_provisional_settle);

        let medium = ScoringParams {
            amount: 10_000 * ONE_ETHER,
            ..params()
        };
        assert!(!scorer.score(&medium).can_provisional_settle);

        let understaked = ScoringParams {
            agent_stake: 100_000 * ONE_ETHER - 1,
            ..params()
        };
        assert!(!scorer.score(&understaked).can_provisional_settle);
    }

    #[test]
    fn test_stability_multiplier_monotonic() {
        let scorer = DeterministicScorer::default();
        assert_eq!(scorer.stability_multiplier(0), 1_200_000);
        assert_eq!(scorer.stability_multiplier(25_000), 1_000_000);
        assert_eq!(scorer.stability_multiplier(50_000), 800_000);
        assert_eq!(scorer.stability_multiplier(u128::MAX), 800_000);

        let mut previous = scorer.stability_multiplier(0);
        for volatility in (0..60_000).step_by(997) {
            let current = scorer.stability_multiplier(volatility);
            assert!(current <= previous);
            previous = current;
        }
    }

    #[test]
    fn test_amount_multiplier_tiers() {
        let scorer = DeterministicScorer::default();
        assert_eq!(scorer.amount_multiplier(0), 1_100_000);
        assert_eq!(scorer.amount_multiplier(1_000 * ONE_ETHER), 1_100_000);
        assert_eq!(scorer.amount_multiplier(5_500 * ONE_ETHER), 1_050_000);
        assert_eq!(scorer.amount_multiplier(10_000 * ONE_ETHER), 1_000_000);
        assert_eq!(scorer.amount_multiplier(55_000 * ONE_ETHER), 950_000);
        assert_eq!(scorer.amount_multiplier(100_000 * ONE_ETHER), 900_000);
        assert_eq!(scorer.amount_multiplier(u128::MAX), 900_000);
    }

    #[test]
    fn test_time_multiplier_buckets() {
        assert_eq!(DeterministicScorer::time_multiplier(1), 1_000_000);
        assert_eq!(DeterministicScorer::time_multiplier(2), 950_000);
        assert_eq!(DeterministicScorer::time_multiplier(5), 950_000);
        assert_eq!(DeterministicScorer::time_multiplier(9), 1_050_000);
        assert_eq!(DeterministicScorer::time_multiplier(12), 1_000_000);
        assert_eq!(DeterministicScorer::time_multiplier(16), 1_050_000);
        assert_eq!(DeterministicScorer::time_multiplier(17), 1_000_000);
    }

    #[test]
    fn test_agent_multiplier_stake_bonus() {
        let scorer = DeterministicScorer::default();
        let min = 100_000 * ONE_ETHER;
        assert_eq!(scorer.agent_multiplier(1_000_000, 0), 1_000_000);
        assert_eq!(scorer.agent_multiplier(1_000_000, min - 1), 1_000_000);
        assert_eq!(scorer.agent_multiplier(1_000_000, min), 1_000_000);
        assert_eq!(scorer.agent_multiplier(1_000_000, min + min / 2), 1_075_000);
        assert_eq!(scorer.agent_multiplier(1_000_000, 2 * min), 1_150_000);
        assert_eq!(scorer.agent_multiplier(1_000_000, 10 * min), 1_150_000);

        let mut previous = scorer.agent_multiplier(900_000, min);
        for step in 1..=20u128 {
            let current = scorer.agent_multiplier(900_000, min + step * min / 10);
            assert!(current >= previous);
            assert!(current <= 1_150_000);
            previous = current;
        }
    }

    #[test]
    fn test_decision_codes() {
        assert_eq!(Decision::QueueFdc.code(), 0);
        assert_eq!(Decision::BufferEarmark.code(), 1);
        assert_eq!(Decision::ProvisionalSettle.code(), 2);
        assert_eq!(Decision::QueueFdc.to_string(), "QueueFDC");
    }
}
