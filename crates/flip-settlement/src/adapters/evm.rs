//! EVM ledger client over JSON-RPC.
//!
//! Reads redemption and minting records from the issuance contract, signs
//! and sends the operator calls, submits attestation requests to the FDC
//! hub, and polls contract logs for the three event streams.

use std::fmt;

use alloy::{
    eips::BlockNumberOrTag,
    network::{EthereumWallet, TransactionBuilder},
    primitives::{address, Address as EvmAddress, Bytes, B256, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::{Filter, Log, TransactionReceipt, TransactionRequest},
    signers::local::PrivateKeySigner,
    sol,
    sol_types::{SolCall, SolEvent},
    transports::{http::reqwest::Url, TransportError},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use flip_core::{
    clean_destination, Address, EscrowLog, EventKind, LedgerEvent, LedgerLog, LedgerScoringArgs,
    LiquidityPosition, Minting, MintingId, MintingRequested, MintingStatus, Redemption,
    RedemptionId, RedemptionRequested, RedemptionStatus, TxReceipt,
};

use crate::error::SettlementError;
use crate::traits::{ChainEventSource, LedgerClient};

sol! {
    #[sol(rpc)]
    interface IFlipCore {
        event RedemptionRequested(uint256 indexed redemptionId, address indexed user, address indexed asset, uint256 amount, uint256 timestamp);
        event EscrowCreated(uint256 indexed redemptionId, address indexed user, uint256 receiptId, uint256 amount, uint256 timestamp);
        event MintingRequested(uint256 indexed mintingId, address indexed user, address indexed asset, uint256 fxrpAmount, string xrplTxHash);

        function nextRedemptionId() external view returns (uint256);
        function nextMintingId() external view returns (uint256);
        function redemptions(uint256 redemptionId) external view returns (address user, address asset, uint256 amount, uint256 requestedAt, uint256 priceLocked, uint256 hedgeId, uint8 status, uint256 fdcRequestId, bool provisionalSettled, string xrplAddress);
        function redemptionXrplTxHash(uint256 redemptionId) external view returns (string);
        function mintingRequests(uint256 mintingId) external view returns (address user, address asset, uint256 collateralReservationId, string xrplTxHash, uint256 xrpAmount, uint256 fxrpAmount, uint256 requestedAt, uint256 priceLocked, uint256 hedgeId, uint8 status, uint256 fdcRequestId, address matchedLP, uint256 haircutRate, bool userAuthorizedFlip);

        function ownerProcessRedemption(uint256 redemptionId, uint256 priceVolatility, uint256 agentSuccessRate, uint256 agentStake) external;
        function recordXrplPayment(uint256 redemptionId, string xrplTxHash) external;
        function handleFDCAttestation(uint256 redemptionId, uint256 requestId, bool success) external;
        function finalizeMintingProvisional(uint256 mintingId, uint256 priceVolatility) external;
    }

    interface IFdcHub {
        function requestAttestation(bytes data) external payable;
    }

    #[sol(rpc)]
    interface IFdcRequestFeeConfigurations {
        function getRequestFee(bytes data) external view returns (uint256);
    }

    struct LpPosition {
        address lp;
        address asset;
        uint256 depositedAmount;
        uint256 availableAmount;
        uint256 minHaircut;
        uint256 maxDelay;
        uint256 totalEarned;
        bool active;
    }

    #[sol(rpc)]
    interface ILiquidityProviderRegistry {
        function getPosition(address lp, address asset) external view returns (LpPosition memory position);
    }
}

/// Attestation fee paid when the fee contract cannot be read (1 FLR).
const FALLBACK_ATTESTATION_FEE: u128 = 1_000_000_000_000_000_000;

/// Connection, contract addresses, and operator key for the EVM ledger.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvmLedgerConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    /// Issuance contract the operator drives.
    pub core_address: Address,
    pub fdc_hub_address: Address,
    pub fee_config_address: Address,
    /// Liquidity provider registry consulted before mintings.
    pub lp_registry_address: Address,
    /// Providers whose positions count towards available liquidity.
    pub liquidity_providers: Vec<Address>,
    /// Operator signing key, hex. Read from the environment, never written out.
    #[serde(skip_serializing)]
    pub private_key: String,
}

impl Default for EvmLedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://coston2-api.flare.network/ext/C/rpc".to_string(),
            chain_id: 114,
            core_address: Address::ZERO,
            fdc_hub_address: from_evm(address!("48aC463d7975828989331F4De43341627b9c5f1D")),
            fee_config_address: from_evm(address!("191a1282Ac700edE65c5B0AaF313BAcC3eA7fC7e")),
            lp_registry_address: Address::ZERO,
            liquidity_providers: Vec::new(),
            private_key: String::new(),
        }
    }
}

impl fmt::Debug for EvmLedgerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmLedgerConfig")
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("core_address", &self.core_address)
            .field("fdc_hub_address", &self.fdc_hub_address)
            .field("fee_config_address", &self.fee_config_address)
            .field("lp_registry_address", &self.lp_registry_address)
            .field("liquidity_providers", &self.liquidity_providers)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl EvmLedgerConfig {
    /// Check the fields a live ledger connection needs.
    pub fn validate(&self) -> Result<(), SettlementError> {
        self.rpc_url()?;
        self.signer()?;
        if self.core_address.is_zero() {
            return Err(SettlementError::Configuration(
                "ledger.core_address must be set".into(),
            ));
        }
        if self.fdc_hub_address.is_zero() {
            return Err(SettlementError::Configuration(
                "ledger.fdc_hub_address must be set".into(),
            ));
        }
        Ok(())
    }

    fn rpc_url(&self) -> Result<Url, SettlementError> {
        self.rpc_url.trim().parse::<Url>().map_err(|e| {
            SettlementError::Configuration(format!("ledger.rpc_url {:?}: {}", self.rpc_url, e))
        })
    }

    fn signer(&self) -> Result<PrivateKeySigner, SettlementError> {
        if self.private_key.is_empty() {
            return Err(SettlementError::Configuration("operator key missing".into()));
        }
        self.private_key
            .parse::<PrivateKeySigner>()
            .map_err(|e| SettlementError::Configuration(format!("operator key: {}", e)))
    }
}

/// [`LedgerClient`] and [`ChainEventSource`] backed by an EVM node.
pub struct EvmLedger {
    provider: DynProvider,
    core: IFlipCore::IFlipCoreInstance<DynProvider>,
    fee_config: IFdcRequestFeeConfigurations::IFdcRequestFeeConfigurationsInstance<DynProvider>,
    registry: ILiquidityProviderRegistry::ILiquidityProviderRegistryInstance<DynProvider>,
    operator: Address,
    config: EvmLedgerConfig,
}

impl EvmLedger {
    /// Build the client. No request is made until the first call.
    pub fn new(config: EvmLedgerConfig) -> Result<Self, SettlementError> {
        config.validate()?;
        let signer = config.signer()?;
        let operator = from_evm(signer.address());
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(config.rpc_url()?)
            .erased();

        Ok(Self {
            core: IFlipCore::new(to_evm(config.core_address), provider.clone()),
            fee_config: IFdcRequestFeeConfigurations::new(
                to_evm(config.fee_config_address),
                provider.clone(),
            ),
            registry: ILiquidityProviderRegistry::new(
                to_evm(config.lp_registry_address),
                provider.clone(),
            ),
            provider,
            operator,
            config,
        })
    }

    /// Fail unless the node serves the configured chain.
    pub async fn verify_chain(&self) -> Result<(), SettlementError> {
        let chain_id = self
            .provider
            .get_chain_id()
            .await
            .map_err(|e| transport("eth_chainId", e))?;
        if chain_id != self.config.chain_id {
            return Err(SettlementError::Configuration(format!(
                "ledger node serves chain {}, expected {}",
                chain_id, self.config.chain_id
            )));
        }
        Ok(())
    }

    /// Sign and send a call, then wait for its receipt.
    ///
    /// A call the node refuses during gas estimation is a ledger rejection;
    /// a mined transaction that reverted comes back with `success == false`.
    async fn transact(
        &self,
        call: &'static str,
        to: EvmAddress,
        input: Vec<u8>,
        value: U256,
    ) -> Result<TransactionReceipt, SettlementError> {
        let tx = TransactionRequest::default()
            .with_to(to)
            .with_input(Bytes::from(input))
            .with_value(value);
        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(|e| rejected_or_transport(call, e))?;
        tracing::debug!(call, tx_hash = %pending.tx_hash(), "ledger transaction sent");
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| SettlementError::Transport(format!("{}: {}", call, e)))?;
        tracing::info!(
            call,
            tx_hash = %receipt.transaction_hash,
            success = receipt.status(),
            gas_used = receipt.gas_used,
            "ledger transaction mined"
        );
        Ok(receipt)
    }

    async fn transact_core(
        &self,
        call: &'static str,
        input: Vec<u8>,
    ) -> Result<TxReceipt, SettlementError> {
        let receipt = self
            .transact(call, to_evm(self.config.core_address), input, U256::ZERO)
            .await?;
        Ok(to_receipt(&receipt))
    }

    async fn attestation_fee(&self, request: &Bytes) -> U256 {
        match self.fee_config.getRequestFee(request.clone()).call().await {
            Ok(fee) => fee,
            Err(e) => {
                tracing::warn!(error = %e, "attestation fee lookup failed, paying fallback fee");
                U256::from(FALLBACK_ATTESTATION_FEE)
            }
        }
    }
}

#[async_trait]
impl LedgerClient for EvmLedger {
    async fn next_redemption_id(&self) -> Result<u64, SettlementError> {
        let next = self
            .core
            .nextRedemptionId()
            .call()
            .await
            .map_err(|e| transport("nextRedemptionId", e))?;
        to_u64("nextRedemptionId", next)
    }

    async fn next_minting_id(&self) -> Result<u64, SettlementError> {
        let next = self
            .core
            .nextMintingId()
            .call()
            .await
            .map_err(|e| transport("nextMintingId", e))?;
        to_u64("nextMintingId", next)
    }

    async fn redemption(&self, id: RedemptionId) -> Result<Redemption, SettlementError> {
        let record = self
            .core
            .redemptions(U256::from(id.0))
            .call()
            .await
            .map_err(|e| transport("redemptions", e))?;
        let tx_hash = self.recorded_payment(id).await?;
        redemption_from_record(id, record, tx_hash)
    }

    async fn minting(&self, id: MintingId) -> Result<Minting, SettlementError> {
        let record = self
            .core
            .mintingRequests(U256::from(id.0))
            .call()
            .await
            .map_err(|e| transport("mintingRequests", e))?;
        minting_from_record(id, record)
    }

    async fn recorded_payment(
        &self,
        id: RedemptionId,
    ) -> Result<Option<String>, SettlementError> {
        let hash = self
            .core
            .redemptionXrplTxHash(U256::from(id.0))
            .call()
            .await
            .map_err(|e| transport("redemptionXrplTxHash", e))?;
        let hash = clean_destination(&hash);
        Ok((!hash.is_empty()).then_some(hash))
    }

    async fn liquidity_positions(
        &self,
        asset: Address,
    ) -> Result<Vec<LiquidityPosition>, SettlementError> {
        let mut positions = Vec::with_capacity(self.config.liquidity_providers.len());
        for provider in &self.config.liquidity_providers {
            let position = self
                .registry
                .getPosition(to_evm(*provider), to_evm(asset))
                .call()
                .await
                .map_err(|e| transport("getPosition", e))?;
            positions.push(LiquidityPosition {
                provider: *provider,
                asset,
                available: to_u128("availableAmount", position.availableAmount)?,
                active: position.active,
            });
        }
        Ok(positions)
    }

    async fn operator(&self) -> Result<Address, SettlementError> {
        Ok(self.operator)
    }

    async fn process_redemption(
        &self,
        id: RedemptionId,
        args: LedgerScoringArgs,
    ) -> Result<TxReceipt, SettlementError> {
        let input = IFlipCore::ownerProcessRedemptionCall {
            redemptionId: U256::from(id.0),
            priceVolatility: U256::from(args.price_volatility),
            agentSuccessRate: U256::from(args.agent_success_rate),
            agentStake: U256::from(args.agent_stake),
        }
        .abi_encode();
        self.transact_core("ownerProcessRedemption", input).await
    }

    async fn record_external_payment(
        &self,
        id: RedemptionId,
        tx_hash: &str,
    ) -> Result<TxReceipt, SettlementError> {
        let input = IFlipCore::recordXrplPaymentCall {
            redemptionId: U256::from(id.0),
            xrplTxHash: tx_hash.to_string(),
        }
        .abi_encode();
        self.transact_core("recordXrplPayment", input).await
    }

    async fn request_attestation(&self, encoded_request: &[u8]) -> Result<u64, SettlementError> {
        let request = Bytes::copy_from_slice(encoded_request);
        let fee = self.attestation_fee(&request).await;
        let input = IFdcHub::requestAttestationCall { data: request }.abi_encode();
        let receipt = self
            .transact(
                "requestAttestation",
                to_evm(self.config.fdc_hub_address),
                input,
                fee,
            )
            .await?;
        if !receipt.status() {
            return Err(SettlementError::LedgerRejected {
                call: "requestAttestation",
                reason: format!("transaction {} reverted", receipt.transaction_hash),
            });
        }

        let block_number = receipt.block_number.ok_or_else(|| {
            SettlementError::Transport("requestAttestation receipt has no block".into())
        })?;
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(block_number))
            .await
            .map_err(|e| transport("eth_getBlockByNumber", e))?
            .ok_or_else(|| {
                SettlementError::Transport(format!("block {} not found", block_number))
            })?;
        Ok(block.header.timestamp)
    }

    async fn submit_attestation(
        &self,
        id: RedemptionId,
        request_id: u64,
        success: bool,
    ) -> Result<TxReceipt, SettlementError> {
        let input = IFlipCore::handleFDCAttestationCall {
            redemptionId: U256::from(id.0),
            requestId: U256::from(request_id),
            success,
        }
        .abi_encode();
        self.transact_core("handleFDCAttestation", input).await
    }

    async fn process_minting(
        &self,
        id: MintingId,
        volatility: u128,
    ) -> Result<TxReceipt, SettlementError> {
        let input = IFlipCore::finalizeMintingProvisionalCall {
            mintingId: U256::from(id.0),
            priceVolatility: U256::from(volatility),
        }
        .abi_encode();
        self.transact_core("finalizeMintingProvisional", input).await
    }
}

#[async_trait]
impl ChainEventSource for EvmLedger {
    async fn head_block(&self) -> Result<u64, SettlementError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| transport("eth_blockNumber", e))
    }

    async fn fetch_events(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<LedgerLog>, SettlementError> {
        let filter = Filter::new()
            .address(to_evm(self.config.core_address))
            .event_signature(event_signature(kind))
            .from_block(from)
            .to_block(to);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| transport("eth_getLogs", e))?;

        let mut decoded = Vec::with_capacity(logs.len());
        for log in &logs {
            let mut entry = match decode_log(kind, log) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!(%kind, error = %e, "skipping undecodable ledger log");
                    continue;
                }
            };
            // The request log carries no destination; the record does.
            if let LedgerEvent::RedemptionRequested(event) = &mut entry.event {
                let record = self
                    .core
                    .redemptions(U256::from(event.redemption_id.0))
                    .call()
                    .await
                    .map_err(|e| transport("redemptions", e))?;
                event.destination = clean_destination(&record.xrplAddress);
            }
            decoded.push(entry);
        }
        Ok(decoded)
    }
}

fn event_signature(kind: EventKind) -> B256 {
    match kind {
        EventKind::RedemptionRequested => IFlipCore::RedemptionRequested::SIGNATURE_HASH,
        EventKind::EscrowCreated => IFlipCore::EscrowCreated::SIGNATURE_HASH,
        EventKind::MintingRequested => IFlipCore::MintingRequested::SIGNATURE_HASH,
    }
}

/// Decode one contract log of the given kind.
pub fn decode_log(kind: EventKind, log: &Log) -> Result<LedgerLog, SettlementError> {
    let block_number = log
        .block_number
        .ok_or_else(|| SettlementError::Transport("log without block number".into()))?;
    let event = match kind {
        EventKind::RedemptionRequested => {
            let event = IFlipCore::RedemptionRequested::decode_log(&log.inner)
                .map_err(|e| decode_error(kind, e))?
                .data;
            LedgerEvent::RedemptionRequested(RedemptionRequested {
                redemption_id: RedemptionId(to_u64("redemptionId", event.redemptionId)?),
                user: from_evm(event.user),
                asset: from_evm(event.asset),
                amount: to_u128("amount", event.amount)?,
                destination: String::new(),
            })
        }
        EventKind::EscrowCreated => {
            let event = IFlipCore::EscrowCreated::decode_log(&log.inner)
                .map_err(|e| decode_error(kind, e))?
                .data;
            LedgerEvent::EscrowCreated(EscrowLog {
                redemption_id: RedemptionId(to_u64("redemptionId", event.redemptionId)?),
                user: from_evm(event.user),
                receipt_id: to_u64("receiptId", event.receiptId)?,
                amount: to_u128("amount", event.amount)?,
                timestamp: to_u64("timestamp", event.timestamp)?,
            })
        }
        EventKind::MintingRequested => {
            let event = IFlipCore::MintingRequested::decode_log(&log.inner)
                .map_err(|e| decode_error(kind, e))?
                .data;
            LedgerEvent::MintingRequested(MintingRequested {
                minting_id: MintingId(to_u64("mintingId", event.mintingId)?),
                user: from_evm(event.user),
                asset: from_evm(event.asset),
                amount: to_u128("fxrpAmount", event.fxrpAmount)?,
                payment_tx_hash: event.xrplTxHash,
            })
        }
    };
    Ok(LedgerLog {
        block_number,
        event,
    })
}

fn redemption_from_record(
    id: RedemptionId,
    record: IFlipCore::redemptionsReturn,
    payment_tx_hash: Option<String>,
) -> Result<Redemption, SettlementError> {
    let request_id = to_u64("fdcRequestId", record.fdcRequestId)?;
    Ok(Redemption {
        id,
        user: from_evm(record.user),
        asset: from_evm(record.asset),
        amount: to_u128("amount", record.amount)?,
        destination: clean_destination(&record.xrplAddress),
        status: RedemptionStatus::from_code(record.status)?,
        payment_tx_hash,
        requested_at: to_u64("requestedAt", record.requestedAt)?,
        attestation_request_id: (request_id != 0).then_some(request_id),
        provisional_settled: record.provisionalSettled,
    })
}

fn minting_from_record(
    id: MintingId,
    record: IFlipCore::mintingRequestsReturn,
) -> Result<Minting, SettlementError> {
    let matched = from_evm(record.matchedLP);
    Ok(Minting {
        id,
        user: from_evm(record.user),
        asset: from_evm(record.asset),
        amount: to_u128("fxrpAmount", record.fxrpAmount)?,
        payment_tx_hash: record.xrplTxHash,
        status: MintingStatus::from_code(record.status)?,
        matched_provider: (!matched.is_zero()).then_some(matched),
        requires_provider_match: record.userAuthorizedFlip,
    })
}

fn to_receipt(receipt: &TransactionReceipt) -> TxReceipt {
    TxReceipt {
        tx_hash: receipt.transaction_hash.to_string(),
        block_number: receipt.block_number.unwrap_or_default(),
        success: receipt.status(),
        gas_used: receipt.gas_used,
    }
}

fn to_evm(address: Address) -> EvmAddress {
    EvmAddress::from(address.0)
}

fn from_evm(address: EvmAddress) -> Address {
    Address(address.0 .0)
}

fn to_u64(field: &str, value: U256) -> Result<u64, SettlementError> {
    u64::try_from(value)
        .map_err(|_| SettlementError::Internal(format!("{} out of range: {}", field, value)))
}

fn to_u128(field: &str, value: U256) -> Result<u128, SettlementError> {
    u128::try_from(value)
        .map_err(|_| SettlementError::Internal(format!("{} out of range: {}", field, value)))
}

fn decode_error(kind: EventKind, err: impl fmt::Display) -> SettlementError {
    SettlementError::Internal(format!("cannot decode {} log: {}", kind, err))
}

fn transport(call: &str, err: impl fmt::Display) -> SettlementError {
    SettlementError::Transport(format!("{}: {}", call, err))
}

/// The node answered with a JSON-RPC error (typically a revert during gas
/// estimation) or the request never got an answer.
fn rejected_or_transport(call: &'static str, err: TransportError) -> SettlementError {
    match err.as_error_resp() {
        Some(resp) => SettlementError::LedgerRejected {
            call,
            reason: resp.message.to_string(),
        },
        None => transport(call, err),
    }
}
