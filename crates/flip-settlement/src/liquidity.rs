use flip_core::Address;

use crate::error::SettlementError;
use crate::traits::LedgerClient;

/// Result of comparing a request against registered provider liquidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiquidityCheck {
    Sufficient { available: u128 },
    Insufficient { available: u128, required: u128 },
}

impl LiquidityCheck {
    pub fn is_sufficient(&self) -> bool {
        matches!(self, Self::Sufficient { .. })
    }
}

/// Sum the liquidity of active providers for `asset` and compare it with
/// `required`. Inactive positions do not count.
pub async fn check_liquidity(
    ledger: &dyn LedgerClient,
    asset: Address,
    required: u128,
) -> Result<LiquidityCheck, SettlementError> {
    let available = ledger
        .liquidity_positions(asset)
        .await?
        .iter()
        .filter(|position| position.active)
        .fold(0u128, |sum, position| sum.saturating_add(position.available));

    if available >= required {
        Ok(LiquidityCheck::Sufficient { available })
    } else {
        Ok(LiquidityCheck::Insufficient {
            available,
            required,
        })
    }
}
