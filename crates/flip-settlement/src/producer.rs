//! Polling producers that turn ledger logs into queued settlement events.
//!
//! One producer runs per event kind. Each walks forward through the chain in
//! bounded block ranges and blocks on its queue when the orchestrator falls
//! behind, which throttles polling to the consumer's pace.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use flip_core::{
    clean_destination, EscrowCreated, EscrowLog, EventKind, LedgerEvent, MintingRequested,
    RedemptionRequested, SettlementConfig,
};

use crate::error::SettlementError;
use crate::shutdown::ShutdownSignal;
use crate::traits::{ChainEventSource, LedgerClient};

/// Floor for the poll interval so a zero setting cannot spin the runtime.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Receiving ends consumed by the orchestrator.
#[derive(Debug)]
pub struct EventQueues {
    pub redemptions: mpsc::Receiver<RedemptionRequested>,
    pub escrows: mpsc::Receiver<EscrowCreated>,
    pub mintings: mpsc::Receiver<MintingRequested>,
}

/// Sending ends, one per producer.
#[derive(Debug, Clone)]
pub struct EventSinks {
    pub redemptions: mpsc::Sender<RedemptionRequested>,
    pub escrows: mpsc::Sender<EscrowCreated>,
    pub mintings: mpsc::Sender<MintingRequested>,
}

impl EventSinks {
    pub fn into_sinks(self) -> [ProducerSink; 3] {
        [
            ProducerSink::RedemptionRequested(self.redemptions),
            ProducerSink::EscrowCreated(self.escrows),
            ProducerSink::MintingRequested(self.mintings),
        ]
    }
}

/// Create the three bounded queues.
pub fn event_channels(capacity: usize) -> (EventSinks, EventQueues) {
    let capacity = capacity.max(1);
    let (redemption_tx, redemption_rx) = mpsc::channel(capacity);
    let (escrow_tx, escrow_rx) = mpsc::channel(capacity);
    let (minting_tx, minting_rx) = mpsc::channel(capacity);
    (
        EventSinks {
            redemptions: redemption_tx,
            escrows: escrow_tx,
            mintings: minting_tx,
        },
        EventQueues {
            redemptions: redemption_rx,
            escrows: escrow_rx,
            mintings: minting_rx,
        },
    )
}

/// Queue a producer delivers into. Its variant selects the event kind polled.
#[derive(Debug, Clone)]
pub enum ProducerSink {
    RedemptionRequested(mpsc::Sender<RedemptionRequested>),
    EscrowCreated(mpsc::Sender<EscrowCreated>),
    MintingRequested(mpsc::Sender<MintingRequested>),
}

impl ProducerSink {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RedemptionRequested(_) => EventKind::RedemptionRequested,
            Self::EscrowCreated(_) => EventKind::EscrowCreated,
            Self::MintingRequested(_) => EventKind::MintingRequested,
        }
    }
}

async fn send_or_cancel<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    shutdown: &ShutdownSignal,
) -> Result<(), SettlementError> {
    tokio::select! {
        _ = shutdown.cancelled() => Err(SettlementError::Cancelled),
        sent = tx.send(item) => sent.map_err(|_| SettlementError::Cancelled),
    }
}

/// Polls one event kind and feeds its queue.
pub struct EventProducer {
    source: Arc<dyn ChainEventSource>,
    ledger: Arc<dyn LedgerClient>,
    sink: ProducerSink,
    lookback: u64,
    max_range: u64,
    interval: Duration,
    next_block: Option<u64>,
    shutdown: ShutdownSignal,
}

impl EventProducer {
    pub fn new(
        source: Arc<dyn ChainEventSource>,
        ledger: Arc<dyn LedgerClient>,
        sink: ProducerSink,
        config: &SettlementConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            source,
            ledger,
            sink,
            lookback: config.start_block_lookback,
            max_range: config.max_block_range.max(1),
            interval: config.polling_interval().max(MIN_POLL_INTERVAL),
            next_block: None,
            shutdown,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.sink.kind()
    }

    /// First block the next poll will query, once known.
    pub fn next_block(&self) -> Option<u64> {
        self.next_block
    }

    /// Fetch and deliver one block range. Returns the number of events queued.
    ///
    /// On error the cursor does not move, so the range is fetched again on the
    /// next poll; redelivery is absorbed by the orchestrator's idempotency.
    pub async fn poll_once(&mut self) -> Result<usize, SettlementError> {
        let head = self.source.head_block().await?;
        let lookback = self.lookback;
        let from = *self
            .next_block
            .get_or_insert_with(|| head.saturating_sub(lookback));
        if from > head {
            return Ok(0);
        }
        let to = head.min(from.saturating_add(self.max_range - 1));

        let logs = self.source.fetch_events(self.kind(), from, to).await?;
        let mut delivered = 0;
        for log in logs {
            if self.deliver(log.event).await? {
                delivered += 1;
            }
        }

        self.next_block = Some(to + 1);
        debug!(kind = %self.kind(), from, to, delivered, "polled block range");
        Ok(delivered)
    }

    /// Returns `false` when the event was dropped.
    async fn deliver(&self, event: LedgerEvent) -> Result<bool, SettlementError> {
        match (&self.sink, event) {
            (ProducerSink::RedemptionRequested(tx), LedgerEvent::RedemptionRequested(e)) => {
                send_or_cancel(tx, e, &self.shutdown).await?;
            }
            (ProducerSink::MintingRequested(tx), LedgerEvent::MintingRequested(e)) => {
                send_or_cancel(tx, e, &self.shutdown).await?;
            }
            (ProducerSink::EscrowCreated(tx), LedgerEvent::EscrowCreated(log)) => {
                let Some(event) = self.enrich_escrow(&log).await? else {
                    return Ok(false);
                };
                send_or_cancel(tx, event, &self.shutdown).await?;
            }
            (sink, other) => {
                warn!(expected = %sink.kind(), got = %other.kind(), "unexpected event kind");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Attach the payout destination, which the escrow log does not carry.
    async fn enrich_escrow(&self, log: &EscrowLog) -> Result<Option<EscrowCreated>, SettlementError> {
        let redemption = self.ledger.redemption(log.redemption_id).await?;
        let destination = clean_destination(&redemption.destination);
        if destination.is_empty() {
            error!(
                redemption_id = log.redemption_id.0,
                "escrow has no payout destination, skipping"
            );
            return Ok(None);
        }
        Ok(Some(EscrowCreated::from_log(log, destination)))
    }

    /// Poll until shutdown.
    pub async fn run(mut self) {
        info!(kind = %self.kind(), interval_ms = self.interval.as_millis() as u64, "producer started");
        loop {
            match self.poll_once().await {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => break,
                Err(e) => warn!(kind = %self.kind(), error = %e, "poll failed"),
            }
            if self.shutdown.sleep(self.interval).await.is_err() {
                break;
            }
        }
        info!(kind = %self.kind(), "producer stopped");
    }
}
