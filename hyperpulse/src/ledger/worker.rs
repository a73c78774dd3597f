use super::StatsLedger;
use crate::trade::TradeEvent;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info};

/// Drain the stats queue into `ledger` until shutdown or until every sender is gone.
///
/// Each receive waits at most `poll_timeout`. On shutdown any trades already queued are applied
/// before returning.
pub async fn run_consumer(
    ledger: Arc<StatsLedger>,
    mut stats_rx: mpsc::Receiver<TradeEvent>,
    mut shutdown: watch::Receiver<bool>,
    poll_timeout: Duration,
) {
    info!("ledger consumer started");
    let mut applied = 0u64;

    if !*shutdown.borrow() {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = tokio::time::timeout(poll_timeout, stats_rx.recv()) => match received {
                    Ok(Some(trade)) => applied += u64::from(ledger.apply(&trade)),
                    Ok(None) => {
                        info!("stats queue closed");
                        break;
                    }
                    Err(_) => {}
                },
            }
        }
    }

    while let Ok(trade) = stats_rx.try_recv() {
        applied += u64::from(ledger.apply(&trade));
    }

    info!(applied, "ledger consumer stopped");
}

/// Periodically snapshot the ledger and evict excess users until shutdown.
///
/// An eviction that removed users triggers an immediate snapshot.
pub async fn run_maintenance(
    ledger: Arc<StatsLedger>,
    persist_interval: Duration,
    evict_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut persist = tokio::time::interval_at(Instant::now() + persist_interval, persist_interval);
    persist.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut evict = tokio::time::interval_at(Instant::now() + evict_interval, evict_interval);
    evict.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = persist.tick() => persist_logged(&ledger).await,
            _ = evict.tick() => {
                let evicted = ledger.evict_excess();
                if evicted > 0 {
                    persist_logged(&ledger).await;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("ledger maintenance stopped");
}

/// Snapshot the ledger, logging (never propagating) failures. The next snapshot retries.
pub async fn persist_logged(ledger: &Arc<StatsLedger>) {
    match ledger.persist_blocking().await {
        Ok(true) => {}
        Ok(false) => debug!("ledger unchanged since last snapshot"),
        Err(error) => error!(
            path = %ledger.path().display(),
            %error,
            "failed to persist ledger snapshot"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::{Instrument, Side, UserId, test_utils::trade};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[tokio::test(start_paused = true)]
    async fn test_consumer_applies_until_shutdown() {
        let ledger = Arc::new(StatsLedger::new("unused.json", 100));
        let (stats_tx, stats_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_consumer(
            Arc::clone(&ledger),
            stats_rx,
            shutdown_rx,
            Duration::from_secs(1),
        ));

        for seq in 0..3 {
            stats_tx.send(trade(seq, Side::Buy, dec!(10), 0)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = ledger.cumulative_stats(&Instrument::new("BTC"));
        let buys: u64 = stats.values().map(|stat| stat.buy_count).sum();
        assert_eq!(buys, 3);

        // Idle consumer keeps polling until shutdown, then drains what is queued
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());

        stats_tx.send(trade(3, Side::Sell, dec!(4), 0)).await.unwrap();
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let seller = UserId::new("0xseller1");
        let stats = ledger.cumulative_stats(&Instrument::new("BTC"));
        assert_eq!(stats[&seller].sell_volume, dec!(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_stops_when_queue_closes() {
        let ledger = Arc::new(StatsLedger::new("unused.json", 100));
        let (stats_tx, stats_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        stats_tx.send(trade(0, Side::Buy, dec!(1), 0)).await.unwrap();
        drop(stats_tx);

        run_consumer(Arc::clone(&ledger), stats_rx, shutdown_rx, Duration::from_secs(1)).await;
        assert_eq!(ledger.user_count(&Instrument::new("BTC")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_persists_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let ledger = Arc::new(StatsLedger::new(&path, 2));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_maintenance(
            Arc::clone(&ledger),
            Duration::from_secs(300),
            Duration::from_secs(3600),
            shutdown_rx,
        ));

        ledger.apply(&trade(0, Side::Buy, dec!(1), 0));
        assert!(ledger.is_dirty());

        // Blocking snapshot completes on the blocking pool while time is paused
        tokio::time::sleep(Duration::from_secs(301)).await;
        for _ in 0..100 {
            if !ledger.is_dirty() && path.exists() {
                break;
            }
            tokio::task::yield_now().await;
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(path.exists());
        assert!(!ledger.is_dirty());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_snapshots_after_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let ledger = Arc::new(StatsLedger::new(&path, 2));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Buyers 0xbuyer0, 0xbuyer1 and 0xbuyer2 with increasing volume
        for seq in 0..3 {
            ledger.apply(&trade(seq, Side::Buy, Decimal::from(seq + 1), 0));
        }

        let handle = tokio::spawn(run_maintenance(
            Arc::clone(&ledger),
            Duration::from_secs(3600),
            Duration::from_secs(60),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..100 {
            if !ledger.is_dirty() && path.exists() {
                break;
            }
            tokio::task::yield_now().await;
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(path.exists());
        assert!(!ledger.is_dirty());

        let restored = StatsLedger::load(&path, 100).cumulative_stats(&Instrument::new("BTC"));
        let mut users: Vec<_> = restored.keys().map(UserId::as_str).collect();
        users.sort_unstable();
        assert_eq!(users, vec!["0xbuyer1", "0xbuyer2"]);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_stops_promptly_on_shutdown() {
        let ledger = Arc::new(StatsLedger::new("unused.json", 100));
        let (_stats_tx, stats_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_consumer(
            Arc::clone(&ledger),
            stats_rx,
            shutdown_rx,
            Duration::from_secs(3600),
        ));
        tokio::task::yield_now().await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("consumer outlived shutdown")
            .unwrap();
    }
}
