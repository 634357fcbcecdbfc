use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Fixed-point scale shared by every ratio on the ledger: 1_000_000 = 100%.
pub const SCALE: u128 = 1_000_000;

/// Identifier of a redemption, assigned monotonically by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RedemptionId(pub u64);

impl fmt::Display for RedemptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a minting request, assigned monotonically by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MintingId(pub u64);

impl fmt::Display for MintingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 20-byte EVM account or contract address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The all-zero address.
    pub const ZERO: Address = Address([0u8; 20]);

    /// Build an address with every byte set to `byte`.
    pub const fn repeat_byte(byte: u8) -> Self {
        Address([byte; 20])
    }

    /// Whether this is the zero address.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| CoreError::InvalidAddress(format!("missing 0x prefix: {}", s)))?;
        if stripped.len() != 40 {
            return Err(CoreError::InvalidAddress(format!(
                "expected 40 hex characters, got {}: {}",
                stripped.len(),
                s
            )));
        }
        let bytes = hex::decode(stripped)
            .map_err(|e| CoreError::InvalidAddress(format!("{}: {}", s, e)))?;
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// On-ledger status of a redemption.
///
/// Discriminants match the `uint8` status codes stored by the ledger contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RedemptionStatus {
    /// Requested by the user, not yet processed by the operator.
    Pending,
    /// Attestation requested, waiting for the oracle round.
    AttestationQueued,
    /// Funds held in escrow, external payment outstanding.
    EscrowCreated,
    /// Attestation accepted, escrow released.
    Finalized,
    /// Attestation reported a failed payment, or the request was rejected.
    Failed,
}

impl RedemptionStatus {
    /// The ledger's status code for this state.
    pub fn code(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::AttestationQueued => 1,
            Self::EscrowCreated => 2,
            Self::Finalized => 3,
            Self::Failed => 4,
        }
    }

    /// Decode a ledger status code.
    pub fn from_code(code: u8) -> Result<Self, CoreError> {
        match code {
            0 => Ok(Self::Pending),
            1 => Ok(Self::AttestationQueued),
            2 => Ok(Self::EscrowCreated),
            3 => Ok(Self::Finalized),
            4 => Ok(Self::Failed),
            _ => Err(CoreError::UnknownStatus {
                kind: "redemption",
                code,
            }),
        }
    }

    /// Whether the ledger will not move this redemption any further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::AttestationQueued => write!(f, "AttestationQueued"),
            Self::EscrowCreated => write!(f, "EscrowCreated"),
            Self::Finalized => write!(f, "Finalized"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// On-ledger status of a minting request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MintingStatus {
    Pending,
    ProvisionalSettled,
    Finalized,
    Failed,
}

impl MintingStatus {
    pub fn code(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::ProvisionalSettled => 1,
            Self::Finalized => 2,
            Self::Failed => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, CoreError> {
        match code {
            0 => Ok(Self::Pending),
            1 => Ok(Self::ProvisionalSettled),
            2 => Ok(Self::Finalized),
            3 => Ok(Self::Failed),
            _ => Err(CoreError::UnknownStatus {
                kind: "minting",
                code,
            }),
        }
    }
}

impl fmt::Display for MintingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::ProvisionalSettled => write!(f, "ProvisionalSettled"),
            Self::Finalized => write!(f, "Finalized"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// A redemption record as stored by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub id: RedemptionId,
    /// Account that requested the redemption.
    pub user: Address,
    /// Ledger asset being redeemed.
    pub asset: Address,
    /// Amount in the rail's smallest unit (drops for XRPL).
    pub amount: u128,
    /// Destination account on the payment rail.
    pub destination: String,
    pub status: RedemptionStatus,
    /// Rail transaction hash recorded on the ledger after payout.
    pub payment_tx_hash: Option<String>,
    /// Unix timestamp (seconds) at which the request was made.
    pub requested_at: u64,
    /// Attestation request id, set once an attestation has been submitted.
    pub attestation_request_id: Option<u64>,
    pub provisional_settled: bool,
}

impl Redemption {
    /// Recorded rail hash, treating an empty string as absent.
    pub fn recorded_payment(&self) -> Option<&str> {
        self.payment_tx_hash
            .as_deref()
            .filter(|hash| !hash.trim().is_empty())
    }
}

/// A minting request as stored by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Minting {
    pub id: MintingId,
    pub user: Address,
    /// Ledger asset to be minted.
    pub asset: Address,
    /// Amount of ledger asset owed to the user.
    pub amount: u128,
    /// Rail transaction with which the user paid in.
    pub payment_tx_hash: String,
    pub status: MintingStatus,
    /// Liquidity provider matched to this request, if any.
    pub matched_provider: Option<Address>,
    /// Whether finalization needs a liquidity provider match.
    pub requires_provider_match: bool,
}

/// A liquidity provider's position for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityPosition {
    pub provider: Address,
    pub asset: Address,
    /// Unreserved liquidity available to back mintings.
    pub available: u128,
    pub active: bool,
}

/// Reference attached to a rail payment so it can be matched to a redemption.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentReference(String);

impl PaymentReference {
    /// 64-character zero-padded lowercase hex of the redemption id.
    ///
    /// This is not the hash-based reference the ledger contract documents;
    /// until that formula is settled the placeholder stays isolated here.
    pub fn placeholder(id: RedemptionId) -> Self {
        Self(format!("{:064x}", id.0))
    }

    /// Wrap an externally supplied reference verbatim.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex encoding of the reference bytes, as carried in a rail memo.
    pub fn memo_hex(&self) -> String {
        hex::encode_upper(self.0.as_bytes())
    }
}

impl fmt::Display for PaymentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which ledger event stream an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    RedemptionRequested,
    EscrowCreated,
    MintingRequested,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::RedemptionRequested,
        EventKind::EscrowCreated,
        EventKind::MintingRequested,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RedemptionRequested => write!(f, "RedemptionRequested"),
            Self::EscrowCreated => write!(f, "EscrowCreated"),
            Self::MintingRequested => write!(f, "MintingRequested"),
        }
    }
}

/// A user asked to redeem ledger assets for rail funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRequested {
    pub redemption_id: RedemptionId,
    pub user: Address,
    pub asset: Address,
    pub amount: u128,
    pub destination: String,
}

/// Raw escrow-created log as emitted by the ledger.
///
/// The log carries no rail destination; producers enrich it into an
/// [`EscrowCreated`] before it reaches the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowLog {
    pub redemption_id: RedemptionId,
    pub user: Address,
    pub receipt_id: u64,
    pub amount: u128,
    pub timestamp: u64,
}

/// An escrow that is ready to be paid out on the rail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowCreated {
    pub redemption_id: RedemptionId,
    pub user: Address,
    pub amount: u128,
    pub destination: String,
    pub reference: PaymentReference,
}

impl EscrowCreated {
    /// Enrich a raw log with the destination read back from the ledger.
    pub fn from_log(log: &EscrowLog, destination: String) -> Self {
        Self {
            redemption_id: log.redemption_id,
            user: log.user,
            amount: log.amount,
            destination,
            reference: PaymentReference::placeholder(log.redemption_id),
        }
    }

    /// Re-synthesize the event from a stored redemption record.
    pub fn from_redemption(redemption: &Redemption) -> Self {
        Self {
            redemption_id: redemption.id,
            user: redemption.user,
            amount: redemption.amount,
            destination: clean_destination(&redemption.destination),
            reference: PaymentReference::placeholder(redemption.id),
        }
    }
}

/// A user paid in on the rail and asked for ledger assets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintingRequested {
    pub minting_id: MintingId,
    pub user: Address,
    pub asset: Address,
    pub amount: u128,
    pub payment_tx_hash: String,
}

/// A decoded ledger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    RedemptionRequested(RedemptionRequested),
    EscrowCreated(EscrowLog),
    MintingRequested(MintingRequested),
}

impl LedgerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RedemptionRequested(_) => EventKind::RedemptionRequested,
            Self::EscrowCreated(_) => EventKind::EscrowCreated,
            Self::MintingRequested(_) => EventKind::MintingRequested,
        }
    }
}

/// A ledger event together with the block that included it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerLog {
    pub block_number: u64,
    pub event: LedgerEvent,
}

/// Result of a mined ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: u64,
    /// Whether the transaction executed without reverting.
    pub success: bool,
    pub gas_used: u64,
}

/// The scoring tuple the ledger's processing calls take as arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerScoringArgs {
    /// Price volatility, scaled by [`SCALE`].
    pub price_volatility: u128,
    /// Historical agent success rate, scaled by [`SCALE`].
    pub agent_success_rate: u128,
    /// Agent stake in the stake token's base unit.
    pub agent_stake: u128,
}

/// Proof produced by the attestation network for one rail payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationProof {
    /// Merkle proof hashes, hex encoded.
    pub merkle_proof: Vec<String>,
    /// Structured attestation response.
    pub response: serde_json::Value,
    /// Voting round in which the attestation was produced.
    pub round_id: u64,
}

impl AttestationProof {
    /// Whether the attested payment succeeded.
    ///
    /// Reads `responseBody.status`: `0` is success, any other number is a
    /// sender or receiver failure. A response without a status counts as
    /// success.
    pub fn payment_succeeded(&self) -> bool {
        match self
            .response
            .get("responseBody")
            .and_then(|body| body.get("status"))
        {
            Some(status) => match status.as_u64() {
                Some(code) => code == 0,
                None => status
                    .as_str()
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(|code| code == 0)
                    .unwrap_or(true),
            },
            None => true,
        }
    }

    /// Request id submitted to the ledger alongside the outcome.
    pub fn request_id(&self) -> u64 {
        self.round_id
    }
}

/// Strip NUL padding and surrounding whitespace from a stored rail address.
pub fn clean_destination(raw: &str) -> String {
    raw.trim_matches('\0').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_address_parse_and_display() {
        let addr: Address = "0x00000000000000000000000000000000000000aB".parse().unwrap();
        assert_eq!(addr.0[19], 0xab);
        assert_eq!(
            addr.to_string(),
            "0x00000000000000000000000000000000000000ab"
        );
    }

    #[test]
    fn test_address_rejects_bad_input() {
        assert!("1234".parse::<Address>().is_err());
        assert!("0x1234".parse::<Address>().is_err());
        assert!("0xzz00000000000000000000000000000000000000"
            .parse::<Address>()
            .is_err());
    }

    #[test]
    fn test_address_serde_as_string() {
        let addr = Address::repeat_byte(0x11);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", addr));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_redemption_status_codes() {
        assert_eq!(RedemptionStatus::EscrowCreated.code(), 2);
        assert_eq!(
            RedemptionStatus::from_code(2).unwrap(),
            RedemptionStatus::EscrowCreated
        );
        assert!(RedemptionStatus::from_code(9).is_err());
        assert!(RedemptionStatus::Finalized.is_terminal());
        assert!(!RedemptionStatus::EscrowCreated.is_terminal());
    }

    #[test]
    fn test_minting_status_codes() {
        assert_eq!(MintingStatus::from_code(0).unwrap(), MintingStatus::Pending);
        assert!(matches!(
            MintingStatus::from_code(7),
            Err(CoreError::UnknownStatus { kind: "minting", code: 7 })
        ));
    }

    #[test]
    fn test_placeholder_reference() {
        let reference = PaymentReference::placeholder(RedemptionId(255));
        assert_eq!(reference.as_str().len(), 64);
        assert!(reference.as_str().ends_with("ff"));
        assert!(reference.as_str().starts_with("000000"));
    }

    #[test]
    fn test_reference_memo_hex() {
        let reference = PaymentReference::from_raw("ab");
        assert_eq!(reference.memo_hex(), "6162");
    }

    #[test]
    fn test_escrow_from_redemption_cleans_destination() {
        let redemption = Redemption {
            id: RedemptionId(4),
            user: Address::repeat_byte(1),
            asset: Address::repeat_byte(2),
            amount: 1_000_000,
            destination: "\0rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe\0\0".into(),
            status: RedemptionStatus::EscrowCreated,
            payment_tx_hash: None,
            requested_at: 0,
            attestation_request_id: None,
            provisional_settled: false,
        };
        let event = EscrowCreated::from_redemption(&redemption);
        assert_eq!(event.destination, "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe");
        assert_eq!(event.reference, PaymentReference::placeholder(RedemptionId(4)));
    }

    #[test]
    fn test_proof_success_derivation() {
        let mut proof = AttestationProof {
            merkle_proof: vec!["0x01".into()],
            response: json!({ "responseBody": { "status": 0 } }),
            round_id: 42,
        };
        assert!(proof.payment_succeeded());
        assert_eq!(proof.request_id(), 42);

        proof.response = json!({ "responseBody": { "status": 2 } });
        assert!(!proof.payment_succeeded());

        proof.response = json!({ "responseBody": { "status": "1" } });
        assert!(!proof.payment_succeeded());

        proof.response = json!({ "other": true });
        assert!(proof.payment_succeeded());
    }

    #[test]
    fn test_event_kind() {
        let event = LedgerEvent::EscrowCreated(EscrowLog {
            redemption_id: RedemptionId(1),
            user: Address::ZERO,
            receipt_id: 0,
            amount: 5,
            timestamp: 0,
        });
        assert_eq!(event.kind(), EventKind::EscrowCreated);
        assert_eq!(format!("{}", EventKind::MintingRequested), "MintingRequested");
    }
}
