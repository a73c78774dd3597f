//! Fixed-capacity ring buffers of the most recent [`TradeEvent`]s.
//!
//! One buffer per instrument plus a global buffer that mirrors every instrument. Appends take
//! the write lock once for both buffers, so readers never observe an event in one buffer but
//! not the other, nor a partially written event.

use crate::trade::{Instrument, TradeEvent};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;

/// Ring buffer that evicts its oldest entry on overflow.
#[derive(Debug, Clone)]
pub struct TradeRing {
    trades: VecDeque<TradeEvent>,
    max_size: usize,
}

impl TradeRing {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            trades: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    /// Push a trade, returning the evicted trade if the ring was full.
    pub fn push(&mut self, trade: TradeEvent) -> Option<TradeEvent> {
        let evicted = if self.trades.len() >= self.max_size {
            self.trades.pop_front()
        } else {
            None
        };
        self.trades.push_back(trade);
        evicted
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn iter(&self) -> impl Iterator<Item = &TradeEvent> {
        self.trades.iter()
    }

    /// Trades with a sequence number strictly greater than `seq`, in receive order.
    ///
    /// Sequence numbers are assigned in receive order, so the scan runs from the back and stops
    /// at the first trade at or below the mark.
    pub fn after_seq(&self, seq: Option<u64>) -> Vec<TradeEvent> {
        let Some(seq) = seq else {
            return self.trades.iter().cloned().collect();
        };
        let start = self
            .trades
            .iter()
            .rposition(|trade| trade.seq <= seq)
            .map_or(0, |index| index + 1);
        self.trades.range(start..).cloned().collect()
    }
}

#[derive(Debug)]
struct StoreInner {
    global: TradeRing,
    instruments: FnvHashMap<Instrument, TradeRing>,
}

/// Registry of recent trades, keyed by [`Instrument`].
///
/// Single writer (the ingestion pipeline), many readers. All reads return owned copies.
#[derive(Debug)]
pub struct RecentTradeStore {
    capacity: usize,
    inner: RwLock<StoreInner>,
}

impl RecentTradeStore {
    /// Create a store holding at most `capacity` trades per instrument and `global_capacity`
    /// trades across all instruments.
    pub fn new(capacity: usize, global_capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(StoreInner {
                global: TradeRing::new(global_capacity),
                instruments: FnvHashMap::default(),
            }),
        }
    }

    /// Append a trade to the global and per-instrument buffers. O(1) amortised.
    pub fn append(&self, trade: TradeEvent) {
        let mut inner = self.inner.write();
        let capacity = self.capacity;
        inner
            .instruments
            .entry(trade.instrument.clone())
            .or_insert_with(|| TradeRing::new(capacity))
            .push(trade.clone());
        inner.global.push(trade);
    }

    /// Copy of every retained trade for `instrument`, oldest first.
    pub fn snapshot(&self, instrument: &Instrument) -> Vec<TradeEvent> {
        self.inner
            .read()
            .instruments
            .get(instrument)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Copy of the global buffer (all instruments), oldest first.
    pub fn global_snapshot(&self) -> Vec<TradeEvent> {
        self.inner.read().global.iter().cloned().collect()
    }

    /// Copy of the trades for `instrument` received after sequence number `seq`.
    pub fn trades_after(&self, instrument: &Instrument, seq: Option<u64>) -> Vec<TradeEvent> {
        self.inner
            .read()
            .instruments
            .get(instrument)
            .map(|ring| ring.after_seq(seq))
            .unwrap_or_default()
    }

    pub fn len(&self, instrument: &Instrument) -> usize {
        self.inner
            .read()
            .instruments
            .get(instrument)
            .map_or(0, TradeRing::len)
    }

    pub fn global_len(&self) -> usize {
        self.inner.read().global.len()
    }

    pub fn instruments(&self) -> Vec<Instrument> {
        self.inner.read().instruments.keys().cloned().collect()
    }
}
