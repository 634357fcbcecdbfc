//! In-process ledger and payment rail.
//!
//! [`MemoryLedger`] models the issuance contract's state machine closely
//! enough to drive the orchestrator end to end: it assigns ids, emits logs on
//! every state change, reverts invalid calls, and can inject reverts or
//! transport failures per call. [`MemoryRail`] keeps a balance and issues
//! deterministic transaction hashes. Both back the `--dry-run` agent mode and
//! the test suites.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use flip_core::{
    Address, AttestationProof, EscrowLog, EventKind, LedgerEvent, LedgerLog, LedgerScoringArgs,
    LiquidityPosition, Minting, MintingId, MintingRequested, MintingStatus, PaymentReference,
    Redemption, RedemptionId, RedemptionRequested, RedemptionStatus, TxReceipt,
};

use crate::error::SettlementError;
use crate::traits::{AttestationService, ChainEventSource, LedgerClient, PaymentRail};

const GAS_PER_CALL: u64 = 90_000;

/// Ledger calls that support fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerCall {
    /// `next_redemption_id` and `next_minting_id`.
    ReadCounters,
    ReadRedemption,
    ProcessRedemption,
    RecordPayment,
    RequestAttestation,
    SubmitAttestation,
    ProcessMinting,
}

impl LedgerCall {
    fn name(&self) -> &'static str {
        match self {
            Self::ReadCounters => "nextId",
            Self::ReadRedemption => "redemptions",
            Self::ProcessRedemption => "processRedemption",
            Self::RecordPayment => "recordExternalPayment",
            Self::RequestAttestation => "requestAttestation",
            Self::SubmitAttestation => "submitAttestation",
            Self::ProcessMinting => "processMinting",
        }
    }
}

/// Kind of injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The call is mined but reverts.
    Revert,
    /// The call never reaches the ledger.
    Transport,
}

/// In-memory issuance ledger.
pub struct MemoryLedger {
    operator: Address,
    redemptions: DashMap<u64, Redemption>,
    mintings: DashMap<u64, Minting>,
    /// (asset, provider) -> position.
    liquidity: DashMap<(Address, Address), LiquidityPosition>,
    logs: DashMap<u64, LedgerLog>,
    faults: DashMap<LedgerCall, (Fault, u32)>,
    calls: DashMap<LedgerCall, u64>,
    next_redemption: AtomicU64,
    next_minting: AtomicU64,
    next_log: AtomicU64,
    block: AtomicU64,
    clock: AtomicU64,
}

impl MemoryLedger {
    pub fn new(operator: Address) -> Self {
        Self {
            operator,
            redemptions: DashMap::new(),
            mintings: DashMap::new(),
            liquidity: DashMap::new(),
            logs: DashMap::new(),
            faults: DashMap::new(),
            calls: DashMap::new(),
            next_redemption: AtomicU64::new(0),
            next_minting: AtomicU64::new(0),
            next_log: AtomicU64::new(0),
            block: AtomicU64::new(1),
            clock: AtomicU64::new(1_700_000_000),
        }
    }

    /// Make the next `times` calls of `call` fail with `fault`.
    pub fn inject_fault(&self, call: LedgerCall, fault: Fault, times: u32) {
        self.faults.insert(call, (fault, times));
    }

    /// Number of times `call` has been invoked, including failed attempts.
    pub fn call_count(&self, call: LedgerCall) -> u64 {
        self.calls.get(&call).map(|c| *c).unwrap_or(0)
    }

    /// Advance the chain without emitting anything.
    pub fn mine_blocks(&self, count: u64) -> u64 {
        self.block.fetch_add(count, Ordering::SeqCst) + count
    }

    /// Set the timestamp reported for the next included block.
    pub fn set_timestamp(&self, unix_secs: u64) {
        self.clock.store(unix_secs, Ordering::SeqCst);
    }

    /// A user requests a redemption. Emits `RedemptionRequested`.
    pub fn request_redemption(
        &self,
        user: Address,
        asset: Address,
        amount: u128,
        destination: &str,
    ) -> RedemptionId {
        let id = RedemptionId(self.next_redemption.fetch_add(1, Ordering::SeqCst));
        self.redemptions.insert(
            id.0,
            Redemption {
                id,
                user,
                asset,
                amount,
                destination: destination.to_string(),
                status: RedemptionStatus::Pending,
                payment_tx_hash: None,
                requested_at: self.clock.load(Ordering::SeqCst),
                attestation_request_id: None,
                provisional_settled: false,
            },
        );
        let block = self.mine_blocks(1);
        self.emit(
            block,
            LedgerEvent::RedemptionRequested(RedemptionRequested {
                redemption_id: id,
                user,
                asset,
                amount,
                destination: destination.to_string(),
            }),
        );
        id
    }

    /// Store a redemption record as-is, without emitting logs.
    ///
    /// Models state persisted before this process started.
    pub fn insert_redemption(&self, redemption: Redemption) {
        let next = redemption.id.0 + 1;
        self.next_redemption.fetch_max(next, Ordering::SeqCst);
        self.redemptions.insert(redemption.id.0, redemption);
    }

    /// A user requests a minting. Emits `MintingRequested`.
    pub fn request_minting(
        &self,
        user: Address,
        asset: Address,
        amount: u128,
        payment_tx_hash: &str,
        requires_provider_match: bool,
    ) -> MintingId {
        let id = MintingId(self.next_minting.fetch_add(1, Ordering::SeqCst));
        self.mintings.insert(
            id.0,
            Minting {
                id,
                user,
                asset,
                amount,
                payment_tx_hash: payment_tx_hash.to_string(),
                status: MintingStatus::Pending,
                matched_provider: None,
                requires_provider_match,
            },
        );
        let block = self.mine_blocks(1);
        self.emit(
            block,
            LedgerEvent::MintingRequested(MintingRequested {
                minting_id: id,
                user,
                asset,
                amount,
                payment_tx_hash: payment_tx_hash.to_string(),
            }),
        );
        id
    }

    /// Register or replace a liquidity provider position.
    pub fn set_liquidity(&self, provider: Address, asset: Address, available: u128, active: bool) {
        self.liquidity.insert(
            (asset, provider),
            LiquidityPosition {
                provider,
                asset,
                available,
                active,
            },
        );
    }

    /// Current redemption record, if it exists.
    pub fn redemption_snapshot(&self, id: RedemptionId) -> Option<Redemption> {
        self.redemptions.get(&id.0).map(|r| r.clone())
    }

    pub fn minting_snapshot(&self, id: MintingId) -> Option<Minting> {
        self.mintings.get(&id.0).map(|m| m.clone())
    }

    fn emit(&self, block_number: u64, event: LedgerEvent) {
        let seq = self.next_log.fetch_add(1, Ordering::SeqCst);
        self.logs.insert(seq, LedgerLog { block_number, event });
    }

    /// Count the call and apply any pending fault. Returns the fault to
    /// report, if one fired.
    fn enter(&self, call: LedgerCall) -> Result<Option<Fault>, SettlementError> {
        *self.calls.entry(call).or_insert(0) += 1;
        let fired = match self.faults.get_mut(&call) {
            Some(mut entry) if entry.1 > 0 => {
                entry.1 -= 1;
                Some(entry.0)
            }
            _ => None,
        };
        match fired {
            Some(Fault::Transport) => Err(SettlementError::Transport(format!(
                "injected transport failure on {}",
                call.name()
            ))),
            other => Ok(other),
        }
    }

    fn receipt(&self, call: LedgerCall, id: u64, success: bool) -> TxReceipt {
        let block_number = self.mine_blocks(1);
        let mut hasher = blake3::Hasher::new();
        hasher.update(call.name().as_bytes());
        hasher.update(&id.to_be_bytes());
        hasher.update(&block_number.to_be_bytes());
        TxReceipt {
            tx_hash: format!("0x{}", hasher.finalize().to_hex()),
            block_number,
            success,
            gas_used: GAS_PER_CALL,
        }
    }

    fn reverted(&self, call: LedgerCall, id: u64, reason: &str) -> TxReceipt {
        tracing::debug!(call = call.name(), id, reason, "ledger call reverted");
        self.receipt(call, id, false)
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn next_redemption_id(&self) -> Result<u64, SettlementError> {
        self.enter(LedgerCall::ReadCounters)?;
        Ok(self.next_redemption.load(Ordering::SeqCst))
    }

    async fn next_minting_id(&self) -> Result<u64, SettlementError> {
        self.enter(LedgerCall::ReadCounters)?;
        Ok(self.next_minting.load(Ordering::SeqCst))
    }

    async fn redemption(&self, id: RedemptionId) -> Result<Redemption, SettlementError> {
        self.enter(LedgerCall::ReadRedemption)?;
        self.redemption_snapshot(id)
            .ok_or(SettlementError::RedemptionNotFound(id))
    }

    async fn minting(&self, id: MintingId) -> Result<Minting, SettlementError> {
        self.minting_snapshot(id)
            .ok_or(SettlementError::MintingNotFound(id))
    }

    async fn liquidity_positions(
        &self,
        asset: Address,
    ) -> Result<Vec<LiquidityPosition>, SettlementError> {
        Ok(self
            .liquidity
            .iter()
            .filter(|entry| entry.key().0 == asset)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn operator(&self) -> Result<Address, SettlementError> {
        Ok(self.operator)
    }

    async fn process_redemption(
        &self,
        id: RedemptionId,
        _args: LedgerScoringArgs,
    ) -> Result<TxReceipt, SettlementError> {
        let call = LedgerCall::ProcessRedemption;
        if self.enter(call)? == Some(Fault::Revert) {
            return Ok(self.reverted(call, id.0, "injected"));
        }
        let escrow = {
            let Some(mut redemption) = self.redemptions.get_mut(&id.0) else {
                return Ok(self.reverted(call, id.0, "unknown redemption"));
            };
            if redemption.status != RedemptionStatus::Pending {
                return Ok(self.reverted(call, id.0, "redemption not pending"));
            }
            redemption.status = RedemptionStatus::EscrowCreated;
            EscrowLog {
                redemption_id: id,
                user: redemption.user,
                receipt_id: id.0,
                amount: redemption.amount,
                timestamp: self.clock.load(Ordering::SeqCst),
            }
        };
        let receipt = self.receipt(call, id.0, true);
        self.emit(receipt.block_number, LedgerEvent::EscrowCreated(escrow));
        Ok(receipt)
    }

    async fn record_external_payment(
        &self,
        id: RedemptionId,
        tx_hash: &str,
    ) -> Result<TxReceipt, SettlementError> {
        let call = LedgerCall::RecordPayment;
        if self.enter(call)? == Some(Fault::Revert) {
            return Ok(self.reverted(call, id.0, "injected"));
        }
        {
            let Some(mut redemption) = self.redemptions.get_mut(&id.0) else {
                return Ok(self.reverted(call, id.0, "unknown redemption"));
            };
            if redemption.status != RedemptionStatus::EscrowCreated
                || redemption.recorded_payment().is_some()
            {
                return Ok(self.reverted(call, id.0, "payment already recorded"));
            }
            redemption.payment_tx_hash = Some(tx_hash.to_string());
        }
        Ok(self.receipt(call, id.0, true))
    }

    async fn request_attestation(&self, _encoded_request: &[u8]) -> Result<u64, SettlementError> {
        let call = LedgerCall::RequestAttestation;
        if self.enter(call)? == Some(Fault::Revert) {
            return Err(SettlementError::LedgerRejected {
                call: call.name(),
                reason: "injected".into(),
            });
        }
        self.mine_blocks(1);
        Ok(self.clock.load(Ordering::SeqCst))
    }

    async fn submit_attestation(
        &self,
        id: RedemptionId,
        request_id: u64,
        success: bool,
    ) -> Result<TxReceipt, SettlementError> {
        let call = LedgerCall::SubmitAttestation;
        if self.enter(call)? == Some(Fault::Revert) {
            return Ok(self.reverted(call, id.0, "injected"));
        }
        {
            let Some(mut redemption) = self.redemptions.get_mut(&id.0) else {
                return Ok(self.reverted(call, id.0, "unknown redemption"));
            };
            if !matches!(
                redemption.status,
                RedemptionStatus::EscrowCreated | RedemptionStatus::AttestationQueued
            ) {
                return Ok(self.reverted(call, id.0, "redemption not awaiting attestation"));
            }
            redemption.attestation_request_id = Some(request_id);
            redemption.status = if success {
                RedemptionStatus::Finalized
            } else {
                RedemptionStatus::Failed
            };
        }
        Ok(self.receipt(call, id.0, true))
    }

    async fn process_minting(
        &self,
        id: MintingId,
        _volatility: u128,
    ) -> Result<TxReceipt, SettlementError> {
        let call = LedgerCall::ProcessMinting;
        if self.enter(call)? == Some(Fault::Revert) {
            return Ok(self.reverted(call, id.0, "injected"));
        }
        let Some(mut minting) = self.mintings.get_mut(&id.0) else {
            return Ok(self.reverted(call, id.0, "unknown minting"));
        };
        if minting.status != MintingStatus::Pending {
            drop(minting);
            return Ok(self.reverted(call, id.0, "minting not pending"));
        }
        if minting.requires_provider_match {
            let matched = self.liquidity.iter_mut().find_map(|mut entry| {
                let (asset, provider) = *entry.key();
                let position = entry.value_mut();
                if asset == minting.asset && position.active && position.available >= minting.amount
                {
                    position.available -= minting.amount;
                    Some(provider)
                } else {
                    None
                }
            });
            match matched {
                Some(provider) => minting.matched_provider = Some(provider),
                None => {
                    drop(minting);
                    return Ok(self.reverted(call, id.0, "no liquidity provider match"));
                }
            }
        }
        minting.status = MintingStatus::ProvisionalSettled;
        drop(minting);
        Ok(self.receipt(call, id.0, true))
    }
}

#[async_trait]
impl ChainEventSource for MemoryLedger {
    async fn head_block(&self) -> Result<u64, SettlementError> {
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn fetch_events(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<LedgerLog>, SettlementError> {
        let mut logs: Vec<(u64, LedgerLog)> = self
            .logs
            .iter()
            .filter(|entry| {
                let log = entry.value();
                log.event.kind() == kind && log.block_number >= from && log.block_number <= to
            })
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        logs.sort_by_key(|(seq, _)| *seq);
        Ok(logs.into_iter().map(|(_, log)| log).collect())
    }
}

/// A payment made through [`MemoryRail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RailPayment {
    pub destination: String,
    pub amount: u128,
    pub reference: PaymentReference,
}

/// In-memory payment rail.
pub struct MemoryRail {
    balance: AtomicU64,
    payments: DashMap<String, RailPayment>,
    finality_polls: DashMap<String, u32>,
    /// Polls a transaction needs before it reports final.
    polls_to_finality: u32,
    rejections: AtomicU32,
    nonce: AtomicU64,
}

impl MemoryRail {
    pub fn new(balance: u64) -> Self {
        Self {
            balance: AtomicU64::new(balance),
            payments: DashMap::new(),
            finality_polls: DashMap::new(),
            polls_to_finality: 0,
            rejections: AtomicU32::new(0),
            nonce: AtomicU64::new(0),
        }
    }

    /// Require `polls` finality checks before a transaction reports final.
    pub fn with_finality_delay(mut self, polls: u32) -> Self {
        self.polls_to_finality = polls;
        self
    }

    /// Reject the next `count` submissions.
    pub fn reject_next(&self, count: u32) {
        self.rejections.store(count, Ordering::SeqCst);
    }

    /// Number of payments that were actually broadcast.
    pub fn sent_count(&self) -> usize {
        self.payments.len()
    }

    pub fn payment(&self, tx_hash: &str) -> Option<RailPayment> {
        self.payments.get(tx_hash).map(|p| p.clone())
    }

    /// Payments sent to a destination.
    pub fn payments_to(&self, destination: &str) -> Vec<RailPayment> {
        self.payments
            .iter()
            .filter(|p| p.value().destination == destination)
            .map(|p| p.value().clone())
            .collect()
    }

    pub fn current_balance(&self) -> u64 {
        self.balance.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentRail for MemoryRail {
    async fn balance(&self) -> Result<u128, SettlementError> {
        Ok(self.current_balance() as u128)
    }

    async fn submit_payment(
        &self,
        destination: &str,
        amount: u128,
        reference: &PaymentReference,
    ) -> Result<String, SettlementError> {
        let rejected = self
            .rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(SettlementError::PaymentRejected(
                "tecPATH_DRY: injected rejection".into(),
            ));
        }

        let drops = u64::try_from(amount)
            .map_err(|_| SettlementError::PaymentRejected(format!("amount {} too large", amount)))?;
        self.balance
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(drops))
            .map_err(|available| SettlementError::InsufficientBalance {
                available: available as u128,
                required: amount,
            })?;

        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let mut hasher = blake3::Hasher::new();
        hasher.update(destination.as_bytes());
        hasher.update(&amount.to_be_bytes());
        hasher.update(reference.as_str().as_bytes());
        hasher.update(&nonce.to_be_bytes());
        let tx_hash = hasher.finalize().to_hex().to_ascii_uppercase();

        self.payments.insert(
            tx_hash.clone(),
            RailPayment {
                destination: destination.to_string(),
                amount,
                reference: reference.clone(),
            },
        );
        tracing::debug!(%tx_hash, destination, amount, "memory rail payment");
        Ok(tx_hash)
    }

    async fn is_finalized(&self, tx_hash: &str) -> Result<bool, SettlementError> {
        if !self.payments.contains_key(tx_hash) {
            return Ok(false);
        }
        let mut polls = self.finality_polls.entry(tx_hash.to_string()).or_insert(0);
        *polls += 1;
        Ok(*polls > self.polls_to_finality)
    }

    fn rail_id(&self) -> &str {
        "memory"
    }
}

/// Attestation service that attests every payment the [`MemoryRail`] knows.
pub struct MemoryAttestation {
    rail: std::sync::Arc<MemoryRail>,
    round: AtomicU64,
    unavailable: AtomicU32,
    requests: AtomicU64,
}

impl MemoryAttestation {
    pub fn new(rail: std::sync::Arc<MemoryRail>) -> Self {
        Self {
            rail,
            round: AtomicU64::new(1),
            unavailable: AtomicU32::new(0),
            requests: AtomicU64::new(0),
        }
    }

    /// Report the proof as unavailable for the next `count` requests.
    pub fn withhold_next(&self, count: u32) {
        self.unavailable.store(count, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttestationService for MemoryAttestation {
    async fn request_proof(&self, tx_hash: &str) -> Result<AttestationProof, SettlementError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let withheld = self
            .unavailable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if withheld {
            return Err(SettlementError::ProofUnavailable(format!(
                "round not finalized for {}",
                tx_hash
            )));
        }
        // Unknown transactions attest as failed payments.
        let status = if self.rail.payment(tx_hash).is_some() { 0 } else { 1 };
        let round_id = self.round.fetch_add(1, Ordering::SeqCst);
        Ok(AttestationProof {
            merkle_proof: vec![format!("0x{}", blake3::hash(tx_hash.as_bytes()).to_hex())],
            response: serde_json::json!({
                "attestationType": "Payment",
                "votingRound": round_id,
                "requestBody": { "transactionId": tx_hash },
                "responseBody": { "status": status },
            }),
            round_id,
        })
    }
}
