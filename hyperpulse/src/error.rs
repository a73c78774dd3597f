use crate::trade::Instrument;
use thiserror::Error;

/// Transport faults raised by a [`FeedConnector`](crate::feed::FeedConnector) or
/// [`FeedSession`](crate::feed::FeedSession).
///
/// These never propagate to callers of the query API. The
/// [`ConnectionManager`](crate::connection::ConnectionManager) records them in its
/// [`ConnectionSnapshot`](crate::connection::ConnectionSnapshot) and reacts via its reconnect
/// policy.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Error)]
pub enum FeedError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("failed to send {frame} frame: {reason}")]
    Send { frame: &'static str, reason: String },

    #[error("subscription not established within {0} seconds")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport closed by peer")]
    Closed,

    #[error("no message received for {0} seconds")]
    Stale(u64),
}

impl FeedError {
    /// Determine if an error means the current session cannot deliver further messages.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            FeedError::Send { .. } => false,
            _ => true,
        }
    }
}

/// Error returned by [`ConnectionManager::subscribe`](crate::connection::ConnectionManager::subscribe).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Error)]
pub enum SubscribeError {
    #[error("already subscribed to {active}, unsubscribe before subscribing to {requested}")]
    AlreadySubscribed {
        active: Instrument,
        requested: Instrument,
    },

    #[error("supervisor has been shut down")]
    ShutDown,
}

/// Per-record validation failure in the ingestion pipeline.
///
/// Records failing validation are dropped and counted; the stream continues.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseError {
    #[error("malformed trade record: {0}")]
    Malformed(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unknown trade side: {0}")]
    UnknownSide(String),

    #[error("invalid {field}: {value}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: String },

    #[error("invalid trade timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// Failure while persisting or loading the [`StatsLedger`](crate::ledger::StatsLedger).
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger serialisation error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("ledger persistence task failed: {0}")]
    Task(String),
}

impl LedgerError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
