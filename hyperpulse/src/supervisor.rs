use crate::{
    aggregator::{WindowOutcome, WindowedAggregator, user_stats_for_window},
    config::PulseConfig,
    connection::{ConnectionManager, ConnectionSnapshot},
    error::SubscribeError,
    feed::{FeedConnector, FeedHandler},
    ingest::{IngestStats, IngestionPipeline},
    ledger::{StatsLedger, UserStat, UserWindowStat, worker},
    store::RecentTradeStore,
    trade::{Instrument, TradeEvent, UserId},
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

/// Owns every component, their background tasks and the query API.
///
/// Construction only wires components together (and restores the ledger snapshot); nothing
/// runs until [`Supervisor::start`]. [`Supervisor::shutdown`] stops every task
/// deterministically and writes a final ledger snapshot.
pub struct Supervisor<C>
where
    C: FeedConnector,
{
    config: PulseConfig,
    store: Arc<RecentTradeStore>,
    pipeline: Arc<IngestionPipeline>,
    aggregator: WindowedAggregator,
    ledger: Arc<StatsLedger>,
    connection: Arc<ConnectionManager<C>>,
    stats_rx: Mutex<Option<mpsc::Receiver<TradeEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl<C> std::fmt::Debug for Supervisor<C>
where
    C: FeedConnector,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("connection", &self.connection_snapshot())
            .field("ingest", &self.ingest_stats())
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

impl<C> Supervisor<C>
where
    C: FeedConnector,
{
    pub fn new(config: PulseConfig, connector: C) -> Self {
        let store = Arc::new(RecentTradeStore::new(
            config.recent_capacity,
            config.global_capacity,
        ));
        let (stats_tx, stats_rx) = mpsc::channel(config.stats_queue_capacity.max(1));
        let pipeline = Arc::new(IngestionPipeline::new(Arc::clone(&store), stats_tx));
        let aggregator = WindowedAggregator::new(Arc::clone(&store), &config);
        let ledger = Arc::new(StatsLedger::load(&config.ledger_path, config.max_users));
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(connector),
            Arc::clone(&pipeline) as Arc<dyn FeedHandler>,
            &config,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            store,
            pipeline,
            aggregator,
            ledger,
            connection,
            stats_rx: Mutex::new(Some(stats_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the background tasks (first call only) and subscribe to `instrument`.
    ///
    /// A `Supervisor` is single-use: once [`Supervisor::shutdown`] has run, `start` fails with
    /// [`SubscribeError::ShutDown`].
    pub async fn start(&self, instrument: Instrument) -> Result<(), SubscribeError> {
        if *self.shutdown_tx.borrow() {
            return Err(SubscribeError::ShutDown);
        }

        let stats_rx = self.stats_rx.lock().take();
        if let Some(stats_rx) = stats_rx {
            let consumer = tokio::spawn(worker::run_consumer(
                Arc::clone(&self.ledger),
                stats_rx,
                self.shutdown_tx.subscribe(),
                self.config.consumer_poll_timeout,
            ));
            let maintenance = tokio::spawn(worker::run_maintenance(
                Arc::clone(&self.ledger),
                self.config.persist_interval,
                self.config.evict_interval,
                self.shutdown_tx.subscribe(),
            ));
            let health = Arc::clone(&self.connection).spawn_health_check(self.shutdown_tx.subscribe());

            self.tasks.lock().extend([
                ("ledger consumer", consumer),
                ("ledger maintenance", maintenance),
                ("health check", health),
            ]);
            info!(network = self.config.network.as_str(), "hyperpulse started");
        }

        self.connection.subscribe(instrument).await
    }

    /// Stop every task, cancel the subscription and write a final ledger snapshot.
    pub async fn shutdown(&self) {
        info!("hyperpulse shutting down");
        self.shutdown_tx.send_replace(true);
        self.connection.unsubscribe().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, task) in tasks {
            if let Err(error) = task.await {
                warn!(task = name, %error, "background task terminated abnormally");
            }
        }

        worker::persist_logged(&self.ledger).await;
        info!("hyperpulse stopped");
    }

    /// Windowed summary of `instrument` over the last `window_minutes`.
    pub fn process_window(&self, instrument: &Instrument, window_minutes: u32) -> WindowOutcome {
        self.aggregator.process_window(instrument, window_minutes)
    }

    /// Per-user flow over `trades` (eg/ the trades of a [`WindowSummary`](crate::WindowSummary)).
    pub fn user_stats_for_window(&self, trades: &[TradeEvent]) -> Vec<UserWindowStat> {
        user_stats_for_window(trades)
    }

    pub fn cumulative_stats(&self, instrument: &Instrument) -> HashMap<UserId, UserStat> {
        self.ledger.cumulative_stats(instrument)
    }

    pub fn connection_snapshot(&self) -> ConnectionSnapshot {
        self.connection.snapshot()
    }

    pub fn ingest_stats(&self) -> IngestStats {
        self.pipeline.stats()
    }

    /// Most recent trades of `instrument` held by the recent-trade store, oldest first.
    pub fn recent_trades(&self, instrument: &Instrument) -> Vec<TradeEvent> {
        self.store.snapshot(instrument)
    }

    pub fn config(&self) -> &PulseConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionStatus, test_utils::MockConnector};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::time::Duration;

    fn config(dir: &tempfile::TempDir) -> PulseConfig {
        PulseConfig::default().with_ledger_path(dir.path().join("ledger.json"))
    }

    fn trades_message(fills: &[(&str, &str, &str)]) -> String {
        let time = Utc::now().timestamp_millis();
        let data: Vec<_> = fills
            .iter()
            .enumerate()
            .map(|(index, (side, px, user))| {
                json!({
                    "coin": "BTC",
                    "side": side,
                    "px": px,
                    "sz": "1",
                    "time": time,
                    "hash": "0x0",
                    "tid": index,
                    "users": [user, "0xcounterparty"],
                })
            })
            .collect();
        json!({ "channel": "trades", "data": data }).to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_starts_on_construction() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(config(&dir), MockConnector::default());

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(supervisor.connection_snapshot().state, ConnectionStatus::Disconnected);
        assert_eq!(supervisor.ingest_stats(), IngestStats::default());
        assert!(supervisor.tasks.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trades_flow_to_window_and_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MockConnector::default());
        let supervisor = Supervisor::new(config(&dir), Arc::clone(&connector));
        let btc = Instrument::new("BTC");

        supervisor.start(btc.clone()).await.unwrap();
        assert_eq!(supervisor.connection_snapshot().state, ConnectionStatus::Connected);

        let mut fills = vec![("B", "100", "0xwhale"); 6];
        fills.extend(vec![("A", "50", "0xbear"); 4]);
        connector.send(&trades_message(&fills));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = supervisor.process_window(&btc, 1);
        let summary = outcome.summary().unwrap();
        assert_eq!(summary.volume_sentiment, 75.0);
        assert_eq!(summary.count_sentiment, 60.0);
        assert_eq!(supervisor.recent_trades(&btc).len(), 10);

        let window_users = supervisor.user_stats_for_window(&summary.trades);
        assert_eq!(window_users[0].user, UserId::new("0xwhale"));
        assert_eq!(window_users[0].stat.buy_volume, dec!(600));

        let cumulative = supervisor.cumulative_stats(&btc);
        assert_eq!(cumulative[&UserId::new("0xwhale")].buy_count, 6);
        assert_eq!(cumulative[&UserId::new("0xbear")].sell_volume, dec!(200));
        assert_eq!(supervisor.ingest_stats().accepted, 10);

        supervisor.shutdown().await;
        assert_eq!(supervisor.connection_snapshot().state, ConnectionStatus::Disconnected);
        assert!(supervisor.tasks.lock().is_empty());

        // Final snapshot restores into an identical ledger
        let restored = StatsLedger::load(dir.path().join("ledger.json"), 1000);
        assert_eq!(restored.cumulative_stats(&btc), cumulative);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejects_second_instrument() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(config(&dir), MockConnector::default());

        supervisor.start(Instrument::new("BTC")).await.unwrap();
        let error = supervisor.start(Instrument::new("ETH")).await.unwrap_err();
        assert!(matches!(error, SubscribeError::AlreadySubscribed { .. }));
        assert_eq!(supervisor.tasks.lock().len(), 3);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_after_shutdown_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MockConnector::default());
        let supervisor = Supervisor::new(config(&dir), Arc::clone(&connector));

        supervisor.start(Instrument::new("BTC")).await.unwrap();
        supervisor.shutdown().await;

        let error = supervisor.start(Instrument::new("BTC")).await.unwrap_err();
        assert_eq!(error, SubscribeError::ShutDown);
        assert_eq!(connector.attempts(), 1);
        assert_eq!(supervisor.connection_snapshot().state, ConnectionStatus::Disconnected);
        assert!(supervisor.tasks.lock().is_empty());
    }
}
