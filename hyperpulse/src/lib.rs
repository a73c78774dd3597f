#![forbid(unsafe_code)]

//! # HyperPulse
//! Trade-flow ingestion core for the Hyperliquid `trades` WebSocket channel.
//!
//! The crate turns an unreliable live feed into two kinds of derived state:
//! * A rolling, on-demand [`WindowSummary`] of buy/sell volume, trade counts, sentiment and a
//!   per-second volume series, cached for a short TTL.
//! * A durable, additive per-user [`UserStat`] ledger that is persisted to disk and bounded by
//!   an eviction policy.
//!
//! Data flow:
//! ```text
//! feed ─► ConnectionManager ─► IngestionPipeline ─┬─► RecentTradeStore ─► WindowedAggregator
//!                                                 └─► stats queue ─► LedgerConsumer ─► StatsLedger
//! ```
//!
//! The [`Supervisor`] owns every component and their background tasks, and exposes the query API.

/// Windowed aggregation over retained trade history, with a TTL result cache.
pub mod aggregator;

/// Runtime options recognised by the core.
pub mod config;

/// Feed subscription lifecycle: staleness detection and bounded reconnects.
pub mod connection;

/// All errors generated in `hyperpulse`.
pub mod error;

/// Transport seam for the upstream trade feed, plus the Hyperliquid WebSocket connector.
pub mod feed;

/// Validation and fan-out of raw feed messages.
pub mod ingest;

/// Durable per-user cumulative statistics.
pub mod ledger;

/// Fixed-capacity recent trade ring buffers.
pub mod store;

/// Lifecycle owner of all components and the query API entry point.
pub mod supervisor;

/// Canonical trade event model.
pub mod trade;

pub use aggregator::{VolumeBucket, WindowOutcome, WindowSummary, WindowedAggregator};
pub use config::{Network, PulseConfig};
pub use connection::{ConnectionManager, ConnectionSnapshot, ConnectionStatus};
pub use error::{FeedError, LedgerError, ParseError, SubscribeError};
pub use ingest::{IngestStats, IngestionPipeline};
pub use ledger::{StatsLedger, UserStat, UserWindowStat};
pub use store::RecentTradeStore;
pub use supervisor::Supervisor;
pub use trade::{Instrument, Side, TradeEvent, UserId};
