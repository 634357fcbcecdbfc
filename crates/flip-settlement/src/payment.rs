use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use flip_core::{PaymentReference, SettlementConfig};

use crate::error::SettlementError;
use crate::retry::{poll_until, retry, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use crate::traits::PaymentRail;

/// Sends payouts on the rail and waits for them to settle.
///
/// A broadcast payment cannot be recalled: neither a finalization timeout nor
/// a shutdown during the wait undoes it.
pub struct PaymentDispatcher {
    rail: Arc<dyn PaymentRail>,
    min_reserve: u128,
    send_policy: RetryPolicy,
    finalization_attempts: u32,
    finalization_poll: Duration,
}

impl PaymentDispatcher {
    pub fn new(rail: Arc<dyn PaymentRail>, config: &SettlementConfig) -> Self {
        Self {
            rail,
            min_reserve: config.min_rail_balance,
            send_policy: RetryPolicy::fixed(
                config.max_payment_retries,
                config.payment_retry_delay(),
            ),
            finalization_attempts: config.finalization_attempts.max(1),
            finalization_poll: config.finalization_poll(),
        }
    }

    pub fn rail(&self) -> &dyn PaymentRail {
        self.rail.as_ref()
    }

    /// Check the balance once, then submit with bounded retries.
    ///
    /// `amount + reserve` must not exceed the current balance.
    pub async fn send(
        &self,
        destination: &str,
        amount: u128,
        reference: &PaymentReference,
        shutdown: &ShutdownSignal,
    ) -> Result<String, SettlementError> {
        let available = self.rail.balance().await?;
        let required = amount.saturating_add(self.min_reserve);
        if required > available {
            warn!(
                rail = self.rail.rail_id(),
                available,
                required,
                "rail balance below payment plus reserve"
            );
            return Err(SettlementError::InsufficientBalance {
                available,
                required,
            });
        }

        let tx_hash = retry(&self.send_policy, shutdown, "submit_payment", |attempt| {
            let rail = self.rail.clone();
            async move {
                tracing::debug!(attempt, destination, amount, "submitting payment");
                rail.submit_payment(destination, amount, reference).await
            }
        })
        .await?;

        info!(
            rail = self.rail.rail_id(),
            %tx_hash,
            destination,
            amount,
            reference = %reference,
            "payment sent"
        );
        Ok(tx_hash)
    }

    /// Block until the rail reports `tx_hash` final.
    pub async fn wait_for_finalization(
        &self,
        tx_hash: &str,
        shutdown: &ShutdownSignal,
    ) -> Result<(), SettlementError> {
        let finalized = poll_until(
            self.finalization_attempts,
            self.finalization_poll,
            shutdown,
            move || async move { Ok(self.rail.is_finalized(tx_hash).await?.then_some(())) },
        )
        .await?;
        match finalized {
            Some(()) => {
                info!(%tx_hash, "payment finalized");
                Ok(())
            }
            None => Err(SettlementError::FinalizationTimeout {
                tx_hash: tx_hash.to_string(),
                attempts: self.finalization_attempts,
            }),
        }
    }
}
