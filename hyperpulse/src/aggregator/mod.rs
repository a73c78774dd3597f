use crate::{
    config::PulseConfig,
    ledger::{UserStat, UserWindowStat},
    store::RecentTradeStore,
    trade::{Instrument, Side, TradeEvent, UserId},
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tracing::debug;

/// TTL cache of computed [`WindowOutcome`]s.
pub mod cache;

pub use cache::WindowCache;

/// Buy and sell flow within one second.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBucket {
    /// Start of the second (trade time floored to whole seconds).
    pub second: DateTime<Utc>,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub buy_count: u64,
    pub sell_count: u64,
}

impl VolumeBucket {
    fn new(second: DateTime<Utc>) -> Self {
        Self {
            second,
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            buy_count: 0,
            sell_count: 0,
        }
    }

    /// Buy volume minus sell volume.
    pub fn delta(&self) -> Decimal {
        self.buy_volume - self.sell_volume
    }

    pub fn total_count(&self) -> u64 {
        self.buy_count + self.sell_count
    }
}

/// Aggregated trade flow of one instrument over a trailing window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSummary {
    pub instrument: Instrument,
    pub window_minutes: u32,
    /// In-window trades, oldest first.
    pub trades: Vec<TradeEvent>,
    /// Per-second flow, oldest first.
    pub buckets: Vec<VolumeBucket>,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub buy_count: u64,
    pub sell_count: u64,
    /// Buy share of total notional, percent. 50 when there is no volume.
    pub volume_sentiment: f64,
    /// Buy share of trade count, percent. 50 when there are no trades.
    pub count_sentiment: f64,
    pub computed_at: DateTime<Utc>,
}

impl WindowSummary {
    pub fn total_volume(&self) -> Decimal {
        self.buy_volume.saturating_add(self.sell_volume)
    }

    pub fn total_count(&self) -> u64 {
        self.buy_count + self.sell_count
    }

    /// Buy volume minus sell volume.
    pub fn volume_delta(&self) -> Decimal {
        self.buy_volume - self.sell_volume
    }

    /// Per-user flow over this window's trades, see [`user_stats_for_window`].
    pub fn user_stats(&self) -> Vec<UserWindowStat> {
        user_stats_for_window(&self.trades)
    }
}

/// Result of a window query.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowOutcome {
    Ready(Arc<WindowSummary>),
    /// Fewer than `required` trades fell inside the window.
    InsufficientData { available: usize, required: usize },
}

impl WindowOutcome {
    pub fn summary(&self) -> Option<&WindowSummary> {
        match self {
            WindowOutcome::Ready(summary) => Some(summary.as_ref()),
            WindowOutcome::InsufficientData { .. } => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, WindowOutcome::Ready(_))
    }
}

/// Time-ordered trades retained for one instrument, beyond the recent-trade store's capacity.
#[derive(Debug, Default)]
struct InstrumentHistory {
    trades: VecDeque<TradeEvent>,
    /// Highest sequence number merged so far.
    last_seq: Option<u64>,
}

impl InstrumentHistory {
    fn merge(&mut self, trades: Vec<TradeEvent>) -> usize {
        let mut merged = 0;
        for trade in trades {
            if self.last_seq.is_some_and(|last| trade.seq <= last) {
                continue;
            }
            self.last_seq = Some(trade.seq);

            match self.trades.back() {
                Some(newest) if newest.time > trade.time => {
                    let index = self.trades.partition_point(|held| held.time <= trade.time);
                    self.trades.insert(index, trade);
                }
                _ => self.trades.push_back(trade),
            }
            merged += 1;
        }
        merged
    }

    fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut pruned = 0;
        while self.trades.front().is_some_and(|trade| trade.time < cutoff) {
            self.trades.pop_front();
            pruned += 1;
        }
        pruned
    }

    fn since(&self, cutoff: DateTime<Utc>) -> Vec<TradeEvent> {
        let start = self.trades.partition_point(|trade| trade.time < cutoff);
        self.trades.range(start..).cloned().collect()
    }
}

/// On-demand windowed aggregation over the [`RecentTradeStore`].
///
/// Each query merges trades ingested since the previous query into a per-instrument history
/// (deduplicated by sequence number), drops history older than the retention period, and
/// summarises the trades inside the requested window. Outcomes are cached per
/// `(instrument, window_minutes)` for a short TTL.
#[derive(Debug)]
pub struct WindowedAggregator {
    store: Arc<RecentTradeStore>,
    retention: Duration,
    min_records: usize,
    history: Mutex<FnvHashMap<Instrument, InstrumentHistory>>,
    cache: Mutex<WindowCache>,
}

impl WindowedAggregator {
    pub fn new(store: Arc<RecentTradeStore>, config: &PulseConfig) -> Self {
        Self {
            store,
            retention: config.retention,
            min_records: config.min_records,
            history: Mutex::new(FnvHashMap::default()),
            cache: Mutex::new(WindowCache::new(config.cache_ttl)),
        }
    }

    /// Summarise the last `window_minutes` of `instrument`, served from cache when fresh.
    pub fn process_window(&self, instrument: &Instrument, window_minutes: u32) -> WindowOutcome {
        if let Some(outcome) = self.cache.lock().get(instrument, window_minutes) {
            return outcome;
        }

        let outcome = self.aggregate_at(instrument, window_minutes, Utc::now());
        self.cache
            .lock()
            .insert(instrument.clone(), window_minutes, outcome.clone());
        outcome
    }

    /// Uncached aggregation as of `now`.
    pub fn aggregate_at(
        &self,
        instrument: &Instrument,
        window_minutes: u32,
        now: DateTime<Utc>,
    ) -> WindowOutcome {
        let last_seq = self
            .history
            .lock()
            .get(instrument)
            .and_then(|history| history.last_seq);
        let fresh = self.store.trades_after(instrument, last_seq);

        let retention_cutoff = cutoff(now, self.retention);
        let window_cutoff = cutoff(now, Duration::from_secs(u64::from(window_minutes) * 60));

        let trades = {
            let mut history = self.history.lock();
            let history = history.entry(instrument.clone()).or_default();
            let merged = history.merge(fresh);
            let pruned = history.prune(retention_cutoff);
            if merged > 0 || pruned > 0 {
                debug!(
                    %instrument,
                    merged,
                    pruned,
                    retained = history.trades.len(),
                    "aggregator history updated"
                );
            }
            history.since(window_cutoff)
        };

        if trades.len() < self.min_records {
            return WindowOutcome::InsufficientData {
                available: trades.len(),
                required: self.min_records,
            };
        }

        WindowOutcome::Ready(Arc::new(summarise(
            instrument.clone(),
            window_minutes,
            trades,
            now,
        )))
    }

    /// Trades currently retained for `instrument` (merged history, not just the window).
    pub fn retained(&self, instrument: &Instrument) -> usize {
        self.history
            .lock()
            .get(instrument)
            .map_or(0, |history| history.trades.len())
    }
}

/// `now - span`, saturating at the earliest representable time.
fn cutoff(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn summarise(
    instrument: Instrument,
    window_minutes: u32,
    trades: Vec<TradeEvent>,
    computed_at: DateTime<Utc>,
) -> WindowSummary {
    let mut buy_volume = Decimal::ZERO;
    let mut sell_volume = Decimal::ZERO;
    let mut buy_count = 0u64;
    let mut sell_count = 0u64;
    let mut buckets = BTreeMap::<i64, VolumeBucket>::new();

    for trade in &trades {
        let second = trade.time.timestamp();
        let bucket = buckets.entry(second).or_insert_with(|| {
            VolumeBucket::new(DateTime::from_timestamp(second, 0).unwrap_or(trade.time))
        });

        match trade.side {
            Side::Buy => {
                buy_volume = buy_volume.saturating_add(trade.notional);
                buy_count += 1;
                bucket.buy_volume = bucket.buy_volume.saturating_add(trade.notional);
                bucket.buy_count += 1;
            }
            Side::Sell => {
                sell_volume = sell_volume.saturating_add(trade.notional);
                sell_count += 1;
                bucket.sell_volume = bucket.sell_volume.saturating_add(trade.notional);
                bucket.sell_count += 1;
            }
        }
    }

    WindowSummary {
        instrument,
        window_minutes,
        trades,
        buckets: buckets.into_values().collect(),
        buy_volume,
        sell_volume,
        buy_count,
        sell_count,
        volume_sentiment: sentiment(buy_volume, sell_volume),
        count_sentiment: sentiment(Decimal::from(buy_count), Decimal::from(sell_count)),
        computed_at,
    }
}

/// Buy share of `buy + sell` as a percentage in `[0, 100]`, 50 when both are zero.
///
/// Inputs are non-negative. A total beyond [`Decimal::MAX`] is computed on halved inputs.
pub fn sentiment(buy: Decimal, sell: Decimal) -> f64 {
    let Some(total) = buy.checked_add(sell) else {
        return sentiment(buy / Decimal::TWO, sell / Decimal::TWO);
    };
    if total.is_zero() {
        return 50.0;
    }
    buy.checked_div(total)
        .and_then(|share| share.checked_mul(Decimal::ONE_HUNDRED))
        .and_then(|percent| percent.to_f64())
        .unwrap_or(50.0)
        .clamp(0.0, 100.0)
}

/// Per-user buy/sell flow over `trades`.
///
/// Buys are credited to the buyer and sells to the seller; unknown participants are skipped.
/// Ordered by buy count, sell count, buy volume and sell volume (all descending), then by user.
pub fn user_stats_for_window(trades: &[TradeEvent]) -> Vec<UserWindowStat> {
    let mut users = FnvHashMap::<&UserId, UserStat>::default();
    for trade in trades {
        let user = trade.aggressor();
        if user.is_unknown() {
            continue;
        }
        users
            .entry(user)
            .or_default()
            .record(trade.side, trade.notional);
    }

    let mut stats: Vec<UserWindowStat> = users
        .into_iter()
        .map(|(user, stat)| UserWindowStat {
            user: user.clone(),
            stat,
        })
        .collect();

    stats.sort_by(|a, b| {
        b.stat
            .buy_count
            .cmp(&a.stat.buy_count)
            .then_with(|| b.stat.sell_count.cmp(&a.stat.sell_count))
            .then_with(|| b.stat.buy_volume.cmp(&a.stat.buy_volume))
            .then_with(|| b.stat.sell_volume.cmp(&a.stat.sell_volume))
            .then_with(|| a.user.cmp(&b.user))
    });
    stats
}
