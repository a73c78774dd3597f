use std::{path::PathBuf, str::FromStr, time::Duration};
use tracing::warn;

const MAINNET_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
const TESTNET_WS_URL: &str = "wss://api.hyperliquid-testnet.xyz/ws";

/// Hyperliquid network the feed connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn ws_url(&self) -> &'static str {
        match self {
            Network::Mainnet => MAINNET_WS_URL,
            Network::Testnet => TESTNET_WS_URL,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }
}

/// Runtime options recognised by the core.
///
/// Built from [`Default`] and refined with the `with_*` methods, or read from the environment
/// via [`PulseConfig::from_env`].
#[derive(Debug, Clone)]
pub struct PulseConfig {
    /// Feed network selection.
    pub network: Network,
    /// A connected feed with no message for longer than this is stale.
    pub heartbeat_interval: Duration,
    /// Period of the connection health check.
    pub health_check_interval: Duration,
    /// Period of the application-level keepalive ping sent on an open session.
    pub ping_interval: Duration,
    /// Consecutive failed reconnects before the connection is marked failed.
    pub max_reconnect_attempts: u32,
    /// Base reconnect backoff, doubled per consecutive failure.
    pub reconnect_delay: Duration,
    /// Upper bound of the reconnect backoff.
    pub max_reconnect_delay: Duration,
    /// Wait after exhausting reconnect attempts before a fresh reconnect cycle.
    pub reconnect_cooldown: Duration,
    /// Recent trades kept per instrument.
    pub recent_capacity: usize,
    /// Recent trades kept across all instruments.
    pub global_capacity: usize,
    /// Bound of the queue between ingestion and the ledger consumer.
    pub stats_queue_capacity: usize,
    /// History retained by the aggregator, independent of any query window.
    pub retention: Duration,
    /// Minimum in-window trades for a window summary.
    pub min_records: usize,
    /// Lifetime of a cached window summary.
    pub cache_ttl: Duration,
    /// Ledger snapshot location.
    pub ledger_path: PathBuf,
    /// Period of ledger snapshots.
    pub persist_interval: Duration,
    /// Period of ledger eviction.
    pub evict_interval: Duration,
    /// Users retained per instrument after eviction.
    pub max_users: usize,
    /// Ledger consumer queue wait before re-checking for shutdown.
    pub consumer_poll_timeout: Duration,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            heartbeat_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(60),
            reconnect_cooldown: Duration::from_secs(300),
            recent_capacity: 1000,
            global_capacity: 1000,
            stats_queue_capacity: 1000,
            retention: Duration::from_secs(30 * 60),
            min_records: 5,
            cache_ttl: Duration::from_secs(2),
            ledger_path: PathBuf::from("data/ledger.json"),
            persist_interval: Duration::from_secs(300),
            evict_interval: Duration::from_secs(3600),
            max_users: 1000,
            consumer_poll_timeout: Duration::from_secs(1),
        }
    }
}

impl PulseConfig {
    /// Defaults overridden by any `HYPERPULSE_*` environment variables that are set.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let testnet = lookup("HYPERPULSE_USE_TESTNET").or_else(|| lookup("USE_TESTNET"));
        if let Some(flag) = testnet {
            if flag.trim().eq_ignore_ascii_case("true") || flag.trim() == "1" {
                config.network = Network::Testnet;
            }
        }

        let secs = |key: &str, current: Duration| {
            parse_or(&lookup, key, current.as_secs()).map_or(current, Duration::from_secs)
        };

        config.heartbeat_interval = secs("HYPERPULSE_HEARTBEAT_SECS", config.heartbeat_interval);
        config.health_check_interval =
            secs("HYPERPULSE_HEALTH_CHECK_SECS", config.health_check_interval);
        config.ping_interval = secs("HYPERPULSE_PING_SECS", config.ping_interval);
        config.reconnect_delay = secs("HYPERPULSE_RECONNECT_DELAY_SECS", config.reconnect_delay);
        config.reconnect_cooldown =
            secs("HYPERPULSE_RECONNECT_COOLDOWN_SECS", config.reconnect_cooldown);
        config.persist_interval = secs("HYPERPULSE_PERSIST_SECS", config.persist_interval);
        config.evict_interval = secs("HYPERPULSE_EVICT_SECS", config.evict_interval);

        if let Some(minutes) = parse_or(&lookup, "HYPERPULSE_RETENTION_MINUTES", 30u64) {
            config.retention = Duration::from_secs(minutes * 60);
        }
        if let Some(attempts) = parse_or(&lookup, "HYPERPULSE_MAX_RECONNECT_ATTEMPTS", 5u32) {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(capacity) = parse_or(&lookup, "HYPERPULSE_RECENT_CAPACITY", 1000usize) {
            config.recent_capacity = capacity;
            config.global_capacity = capacity;
        }
        if let Some(capacity) = parse_or(&lookup, "HYPERPULSE_QUEUE_SIZE", 1000usize) {
            config.stats_queue_capacity = capacity;
        }
        if let Some(min_records) = parse_or(&lookup, "HYPERPULSE_MIN_RECORDS", 5usize) {
            config.min_records = min_records;
        }
        if let Some(max_users) = parse_or(&lookup, "HYPERPULSE_MAX_USERS", 1000usize) {
            config.max_users = max_users;
        }
        if let Some(path) = lookup("HYPERPULSE_LEDGER_PATH") {
            config.ledger_path = PathBuf::from(path);
        }

        config
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, max_attempts: u32, delay: Duration, cooldown: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_delay = delay;
        self.reconnect_cooldown = cooldown;
        self
    }

    pub fn with_recent_capacity(mut self, capacity: usize) -> Self {
        self.recent_capacity = capacity;
        self.global_capacity = capacity;
        self
    }

    pub fn with_stats_queue_capacity(mut self, capacity: usize) -> Self {
        self.stats_queue_capacity = capacity;
        self
    }

    pub fn with_min_records(mut self, min_records: usize) -> Self {
        self.min_records = min_records;
        self
    }

    pub fn with_ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = path.into();
        self
    }

    pub fn with_max_users(mut self, max_users: usize) -> Self {
        self.max_users = max_users;
        self
    }
}

/// Parse `key` if set. Returns `None` when unset or unparseable (the latter is logged).
fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, %default, "ignoring unparseable config value");
            None
        }
    }
}
