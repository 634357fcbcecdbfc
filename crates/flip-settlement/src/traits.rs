use async_trait::async_trait;

use flip_core::{
    Address, AttestationProof, EventKind, LedgerLog, LedgerScoringArgs, LiquidityPosition,
    Minting, MintingId, PaymentReference, Redemption, RedemptionId, TxReceipt,
};

use crate::error::SettlementError;

/// Read and write access to the issuance ledger contract.
///
/// Write calls return once the transaction is included; a receipt with
/// `success == false` means the call reverted. Use [`ensure_success`] to turn
/// that into a [`SettlementError::LedgerRejected`].
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// One past the highest redemption id assigned so far.
    async fn next_redemption_id(&self) -> Result<u64, SettlementError>;

    /// One past the highest minting id assigned so far.
    async fn next_minting_id(&self) -> Result<u64, SettlementError>;

    async fn redemption(&self, id: RedemptionId) -> Result<Redemption, SettlementError>;

    async fn minting(&self, id: MintingId) -> Result<Minting, SettlementError>;

    /// Rail transaction hash recorded for a redemption, if any.
    async fn recorded_payment(
        &self,
        id: RedemptionId,
    ) -> Result<Option<String>, SettlementError> {
        let redemption = self.redemption(id).await?;
        Ok(redemption.recorded_payment().map(str::to_string))
    }

    /// Liquidity provider positions registered for an asset.
    async fn liquidity_positions(
        &self,
        asset: Address,
    ) -> Result<Vec<LiquidityPosition>, SettlementError>;

    /// Account allowed to drive settlements.
    async fn operator(&self) -> Result<Address, SettlementError>;

    async fn process_redemption(
        &self,
        id: RedemptionId,
        args: LedgerScoringArgs,
    ) -> Result<TxReceipt, SettlementError>;

    async fn record_external_payment(
        &self,
        id: RedemptionId,
        tx_hash: &str,
    ) -> Result<TxReceipt, SettlementError>;

    /// Submit an encoded attestation request to the oracle hub.
    ///
    /// Returns the timestamp of the block that included the request, which
    /// determines its voting round.
    async fn request_attestation(&self, encoded_request: &[u8]) -> Result<u64, SettlementError>;

    async fn submit_attestation(
        &self,
        id: RedemptionId,
        request_id: u64,
        success: bool,
    ) -> Result<TxReceipt, SettlementError>;

    async fn process_minting(
        &self,
        id: MintingId,
        volatility: u128,
    ) -> Result<TxReceipt, SettlementError>;
}

/// Source of decoded ledger events.
#[async_trait]
pub trait ChainEventSource: Send + Sync {
    async fn head_block(&self) -> Result<u64, SettlementError>;

    /// Events of one kind in the inclusive block range `[from, to]`.
    async fn fetch_events(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<LedgerLog>, SettlementError>;
}

/// External payment rail used for redemption payouts.
#[async_trait]
pub trait PaymentRail: Send + Sync {
    /// Spendable balance of the agent's account, in the rail's base unit.
    async fn balance(&self) -> Result<u128, SettlementError>;

    /// Broadcast a payment and return its transaction hash.
    async fn submit_payment(
        &self,
        destination: &str,
        amount: u128,
        reference: &PaymentReference,
    ) -> Result<String, SettlementError>;

    /// Whether the rail considers the transaction final.
    async fn is_finalized(&self, tx_hash: &str) -> Result<bool, SettlementError>;

    /// Short identifier for logs (e.g. "xrpl").
    fn rail_id(&self) -> &str;
}

/// Produces attestation proofs for rail payments.
#[async_trait]
pub trait AttestationService: Send + Sync {
    async fn request_proof(&self, tx_hash: &str) -> Result<AttestationProof, SettlementError>;
}

/// Turn a reverted receipt into an error.
pub fn ensure_success(call: &'static str, receipt: TxReceipt) -> Result<TxReceipt, SettlementError> {
    if receipt.success {
        Ok(receipt)
    } else {
        Err(SettlementError::LedgerRejected {
            call,
            reason: format!("transaction {} reverted", receipt.tx_hash),
        })
    }
}
