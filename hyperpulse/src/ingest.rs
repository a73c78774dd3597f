//! Validation and fan-out of raw Hyperliquid `trades` messages.
//!
//! ### Raw Payload Examples
//! See docs: <https://hyperliquid.gitbook.io/hyperliquid-docs/for-developers/api/websocket/subscriptions>
//! ```json
//! {
//!     "channel": "trades",
//!     "data": [
//!         {
//!             "coin": "BTC",
//!             "side": "B",
//!             "px": "97165.0",
//!             "sz": "0.00113",
//!             "time": 1734011442366,
//!             "hash": "0x2d6e2b6c4b2b0c5f9c3e0415a5b0e10201f5005f2a5d1a7b6f5c8d2e4a1b3c9d",
//!             "tid": 911294718012345,
//!             "users": ["0x31ca8395cf837de08b24da3f660e77761dfb974b", "0x010461c14e146ac35fe42271bdc1134ee31c703a"]
//!         }
//!     ]
//! }
//! ```

use crate::{
    error::ParseError,
    feed::FeedHandler,
    store::RecentTradeStore,
    trade::{Instrument, Side, TradeEvent, UserId},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Minimum spacing between "stats queue dropping" warnings.
const DROP_WARNING_INTERVAL: Duration = Duration::from_secs(10);

/// Counters describing what the [`IngestionPipeline`] did with the records it received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct IngestStats {
    /// Valid records appended to the recent-trade store.
    pub accepted: u64,
    /// Records that failed validation and were dropped.
    pub malformed: u64,
    /// Valid records not delivered to the ledger because its queue was full or closed.
    pub ledger_dropped: u64,
}

/// Envelope of every Hyperliquid WebSocket message.
#[derive(Debug, Deserialize)]
struct HyperliquidMessage {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

/// One element of a `trades` message `data` array, before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HyperliquidTrade {
    coin: Option<String>,
    side: Option<String>,
    px: Option<Value>,
    sz: Option<Value>,
    time: Option<Value>,
    hash: Option<String>,
    tid: Option<u64>,
    users: Vec<String>,
}

/// Turns raw feed payloads into [`TradeEvent`]s.
///
/// Every valid record is appended to the [`RecentTradeStore`] and offered to the bounded stats
/// queue without blocking. A full (or closed) queue only costs the ledger the update: recent
/// trade visibility is unaffected.
#[derive(Debug)]
pub struct IngestionPipeline {
    store: Arc<RecentTradeStore>,
    stats_tx: mpsc::Sender<TradeEvent>,
    next_seq: AtomicU64,
    accepted: AtomicU64,
    malformed: AtomicU64,
    ledger_dropped: AtomicU64,
    last_drop_warning: Mutex<Option<Instant>>,
}

impl IngestionPipeline {
    pub fn new(store: Arc<RecentTradeStore>, stats_tx: mpsc::Sender<TradeEvent>) -> Self {
        Self {
            store,
            stats_tx,
            next_seq: AtomicU64::new(1),
            accepted: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            ledger_dropped: AtomicU64::new(0),
            last_drop_warning: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            ledger_dropped: self.ledger_dropped.load(Ordering::Relaxed),
        }
    }

    /// Validate and publish every record of a raw feed payload.
    ///
    /// Payloads that are not trade batches (subscription acknowledgements, pongs, server
    /// notices) are ignored. Each record is validated independently.
    pub fn ingest(&self, raw: &str) {
        let message = match serde_json::from_str::<HyperliquidMessage>(raw) {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, payload = raw, "ignoring non-JSON feed payload");
                return;
            }
        };

        if message.channel.as_deref() != Some("trades") {
            debug!(channel = ?message.channel, "ignoring non-trade feed message");
            return;
        }

        let Value::Array(records) = message.data else {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(payload = raw, "trades message without a data array");
            return;
        };

        for record in records {
            match parse_trade(record, || self.next_seq.fetch_add(1, Ordering::Relaxed)) {
                Ok(trade) => self.publish(trade),
                Err(error) => {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(%error, "dropping malformed trade record");
                }
            }
        }
    }

    fn publish(&self, trade: TradeEvent) {
        self.store.append(trade.clone());
        self.accepted.fetch_add(1, Ordering::Relaxed);

        match self.stats_tx.try_send(trade) {
            Ok(()) => {}
            Err(TrySendError::Full(trade)) => self.record_ledger_drop("full", &trade),
            Err(TrySendError::Closed(trade)) => self.record_ledger_drop("closed", &trade),
        }
    }

    fn record_ledger_drop(&self, reason: &'static str, trade: &TradeEvent) {
        let dropped = self.ledger_dropped.fetch_add(1, Ordering::Relaxed) + 1;

        let mut last_warning = self.last_drop_warning.lock();
        let now = Instant::now();
        if last_warning.is_none_or(|at| now.duration_since(at) >= DROP_WARNING_INTERVAL) {
            *last_warning = Some(now);
            warn!(
                reason,
                dropped,
                instrument = %trade.instrument,
                seq = trade.seq,
                "stats queue rejected trade, ledger update dropped"
            );
        }
    }
}

impl FeedHandler for IngestionPipeline {
    fn handle_message(&self, raw: &str) {
        self.ingest(raw);
    }
}

/// Validate one raw trade record. `next_seq` is only invoked once the record is known valid.
fn parse_trade<F>(record: Value, next_seq: F) -> Result<TradeEvent, ParseError>
where
    F: FnOnce() -> u64,
{
    let trade = HyperliquidTrade::deserialize(record)
        .map_err(|error| ParseError::Malformed(error.to_string()))?;

    let coin = trade
        .coin
        .filter(|coin| !coin.trim().is_empty())
        .ok_or(ParseError::MissingField("coin"))?;
    let side = Side::from_wire(trade.side.as_deref().ok_or(ParseError::MissingField("side"))?)?;
    let price = parse_decimal("px", trade.px.as_ref())?;
    let quantity = parse_decimal("sz", trade.sz.as_ref())?;
    let time = parse_time(trade.time.as_ref())?;

    // Hyperliquid lists the aggressor first: [buyer, seller] for buys, [seller, buyer] for sells
    let first = trade.users.first().map_or(UserId::UNKNOWN, UserId::new);
    let second = trade.users.get(1).map_or(UserId::UNKNOWN, UserId::new);
    let (buyer, seller) = match side {
        Side::Buy => (first, second),
        Side::Sell => (second, first),
    };

    let event = TradeEvent::new(
        0,
        time,
        side,
        price,
        quantity,
        Instrument::new(coin),
        buyer,
        seller,
    )?
    .with_trade_id(trade.tid)
    .with_hash(trade.hash.map(SmolStr::from));

    Ok(TradeEvent {
        seq: next_seq(),
        ..event
    })
}

/// Hyperliquid encodes decimals as strings, but numeric JSON is tolerated.
fn parse_decimal(field: &'static str, value: Option<&Value>) -> Result<Decimal, ParseError> {
    let raw = match value {
        None | Some(Value::Null) => return Err(ParseError::MissingField(field)),
        Some(Value::String(raw)) => raw.trim().to_string(),
        Some(Value::Number(number)) => number.to_string(),
        Some(other) => {
            return Err(ParseError::InvalidNumber {
                field,
                value: other.to_string(),
            });
        }
    };

    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|_| ParseError::InvalidNumber { field, value: raw })
}

/// Epoch milliseconds, as a JSON number or numeric string.
fn parse_time(value: Option<&Value>) -> Result<DateTime<Utc>, ParseError> {
    let millis = match value {
        None | Some(Value::Null) => return Err(ParseError::MissingField("time")),
        Some(Value::Number(number)) => number.as_i64(),
        Some(Value::String(raw)) => raw.trim().parse::<i64>().ok(),
        Some(_) => None,
    }
    .ok_or_else(|| ParseError::InvalidNumber {
        field: "time",
        value: value.map(Value::to_string).unwrap_or_default(),
    })?;

    if millis <= 0 {
        return Err(ParseError::InvalidTimestamp(millis));
    }
    DateTime::from_timestamp_millis(millis).ok_or(ParseError::InvalidTimestamp(millis))
}
