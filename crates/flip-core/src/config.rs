use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the settlement pipeline.
///
/// Durations are stored as whole seconds so the struct maps directly onto the
/// agent's TOML `[agent]` section; use the accessor methods to get a
/// [`Duration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Capacity of each producer-to-orchestrator queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Interval between producer polls of the ledger.
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
    /// Blocks behind head at which producers start scanning.
    #[serde(default = "default_start_block_lookback")]
    pub start_block_lookback: u64,
    /// Largest block range fetched per producer poll.
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    /// Attempts made to send a rail payment before giving up.
    #[serde(default = "default_max_payment_retries")]
    pub max_payment_retries: u32,
    #[serde(default = "default_payment_retry_delay")]
    pub payment_retry_delay_secs: u64,
    /// Polls of the rail before finalization is reported as timed out.
    #[serde(default = "default_finalization_attempts")]
    pub finalization_attempts: u32,
    #[serde(default = "default_finalization_poll")]
    pub finalization_poll_secs: u64,
    /// Attempts made to submit an attestation outcome to the ledger.
    #[serde(default = "default_proof_submit_attempts")]
    pub proof_submit_attempts: u32,
    #[serde(default = "default_proof_submit_delay")]
    pub proof_submit_delay_secs: u64,
    /// Attempts made to record a payment hash on the ledger.
    #[serde(default = "default_record_attempts")]
    pub record_payment_attempts: u32,
    /// Reserve that must remain on the rail account after a payment, in drops.
    #[serde(default = "default_min_balance", with = "crate::amount_serde")]
    pub min_rail_balance: u128,
    /// Defer mintings that active liquidity cannot cover.
    #[serde(default = "default_true")]
    pub liquidity_check: bool,
}

fn default_queue_capacity() -> usize {
    10
}
fn default_polling_interval() -> u64 {
    5
}
fn default_start_block_lookback() -> u64 {
    50
}
fn default_max_block_range() -> u64 {
    1_000
}
fn default_max_payment_retries() -> u32 {
    3
}
fn default_payment_retry_delay() -> u64 {
    5
}
fn default_finalization_attempts() -> u32 {
    10
}
fn default_finalization_poll() -> u64 {
    1
}
fn default_proof_submit_attempts() -> u32 {
    3
}
fn default_proof_submit_delay() -> u64 {
    5
}
fn default_record_attempts() -> u32 {
    3
}
fn default_min_balance() -> u128 {
    10_000_000
}
fn default_true() -> bool {
    true
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            polling_interval_secs: default_polling_interval(),
            start_block_lookback: default_start_block_lookback(),
            max_block_range: default_max_block_range(),
            max_payment_retries: default_max_payment_retries(),
            payment_retry_delay_secs: default_payment_retry_delay(),
            finalization_attempts: default_finalization_attempts(),
            finalization_poll_secs: default_finalization_poll(),
            proof_submit_attempts: default_proof_submit_attempts(),
            proof_submit_delay_secs: default_proof_submit_delay(),
            record_payment_attempts: default_record_attempts(),
            min_rail_balance: default_min_balance(),
            liquidity_check: default_true(),
        }
    }
}

impl SettlementConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn payment_retry_delay(&self) -> Duration {
        Duration::from_secs(self.payment_retry_delay_secs)
    }

    pub fn finalization_poll(&self) -> Duration {
        Duration::from_secs(self.finalization_poll_secs)
    }

    pub fn proof_submit_delay(&self) -> Duration {
        Duration::from_secs(self.proof_submit_delay_secs)
    }

    /// Configuration with every delay set to zero, for tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            polling_interval_secs: 0,
            payment_retry_delay_secs: 0,
            finalization_poll_secs: 0,
            proof_submit_delay_secs: 0,
            ..Self::default()
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), crate::CoreError> {
        if self.queue_capacity == 0 {
            return Err(crate::CoreError::InvalidConfig(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        if self.max_block_range == 0 {
            return Err(crate::CoreError::InvalidConfig(
                "max_block_range must be greater than zero".into(),
            ));
        }
        if self.max_payment_retries == 0 || self.proof_submit_attempts == 0 {
            return Err(crate::CoreError::InvalidConfig(
                "retry counts must be at least one".into(),
            ));
        }
        Ok(())
    }
}
