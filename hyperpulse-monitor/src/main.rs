use hyperpulse::{
    ConnectionSnapshot, ConnectionStatus, Instrument, PulseConfig, Supervisor, UserId, UserStat,
    WindowOutcome,
    feed::HyperliquidConnector,
};
use rust_decimal::Decimal;
use rustls::crypto::ring::default_provider;
use std::{collections::HashMap, time::Duration};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Period of the status report (the dashboard refresh rate).
const REPORT_INTERVAL: Duration = Duration::from_secs(2);

/// Users listed per ranking in each report.
const TOP_USERS: usize = 5;

#[tokio::main]
async fn main() {
    // Initialise rustls crypto provider for WSS connections
    let _ = default_provider().install_default();

    init_logging();

    let config = PulseConfig::from_env();
    let coin = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("HYPERPULSE_COIN").ok())
        .unwrap_or_else(|| "BTC".to_string());
    let instrument = Instrument::new(coin);
    let window_minutes = std::env::var("HYPERPULSE_WINDOW_MINUTES")
        .ok()
        .and_then(|minutes| minutes.parse::<u32>().ok())
        .filter(|minutes| *minutes > 0)
        .unwrap_or(1);

    info!(
        %instrument,
        window_minutes,
        network = config.network.as_str(),
        ledger = %config.ledger_path.display(),
        "starting hyperpulse monitor"
    );

    let connector = HyperliquidConnector::new(config.network, config.ping_interval);
    let supervisor = Supervisor::new(config, connector);

    if let Err(error) = supervisor.start(instrument.clone()).await {
        error!(%error, "failed to start trade feed");
        supervisor.shutdown().await;
        return;
    }

    let mut report = tokio::time::interval(REPORT_INTERVAL);
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = report.tick() => log_report(&supervisor, &instrument, window_minutes),
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(%error, "failed to listen for ctrl-c, shutting down");
                }
                break;
            }
        }
    }

    supervisor.shutdown().await;
}

fn log_report(
    supervisor: &Supervisor<HyperliquidConnector>,
    instrument: &Instrument,
    window_minutes: u32,
) {
    log_connection(&supervisor.connection_snapshot());

    match supervisor.process_window(instrument, window_minutes) {
        WindowOutcome::Ready(summary) => {
            let latest = summary.buckets.last();
            info!(
                %instrument,
                window_minutes,
                trades = summary.total_count(),
                buy_volume = %summary.buy_volume.round_dp(2),
                sell_volume = %summary.sell_volume.round_dp(2),
                delta = %summary.volume_delta().round_dp(2),
                volume_sentiment = format!("{:.1}%", summary.volume_sentiment),
                count_sentiment = format!("{:.1}%", summary.count_sentiment),
                last_second_delta = %latest.map_or(Decimal::ZERO, |bucket| bucket.delta()).round_dp(2),
                last_second_trades = latest.map_or(0, |bucket| bucket.total_count()),
                "window summary"
            );

            for (rank, entry) in supervisor
                .user_stats_for_window(&summary.trades)
                .iter()
                .take(TOP_USERS)
                .enumerate()
            {
                info!(
                    rank = rank + 1,
                    user = %entry.user,
                    buys = entry.stat.buy_count,
                    sells = entry.stat.sell_count,
                    buy_volume = %entry.stat.buy_volume.round_dp(2),
                    sell_volume = %entry.stat.sell_volume.round_dp(2),
                    "window top user"
                );
            }
        }
        WindowOutcome::InsufficientData {
            available,
            required,
        } => {
            info!(%instrument, window_minutes, available, required, "waiting for trades");
        }
    }

    for (rank, (user, stat)) in top_cumulative(supervisor.cumulative_stats(instrument))
        .iter()
        .enumerate()
    {
        info!(
            rank = rank + 1,
            %user,
            trades = stat.total_count(),
            total_volume = %stat.total_volume().round_dp(2),
            "cumulative top user"
        );
    }

    let ingest = supervisor.ingest_stats();
    if ingest.malformed > 0 || ingest.ledger_dropped > 0 {
        warn!(
            accepted = ingest.accepted,
            malformed = ingest.malformed,
            ledger_dropped = ingest.ledger_dropped,
            "ingestion degraded"
        );
    }
}

fn log_connection(snapshot: &ConnectionSnapshot) {
    let age_secs = snapshot.last_message_age.map(|age| age.as_secs());
    match snapshot.state {
        ConnectionStatus::Connected => info!(
            state = %snapshot.state,
            last_message_age_secs = ?age_secs,
            total_reconnects = snapshot.total_reconnects,
            "feed"
        ),
        _ => warn!(
            state = %snapshot.state,
            reconnect_attempts = snapshot.reconnect_count,
            last_error = ?snapshot.last_error,
            last_error_at = ?snapshot.last_error_at,
            "feed"
        ),
    }
}

fn top_cumulative(stats: HashMap<UserId, UserStat>) -> Vec<(UserId, UserStat)> {
    let mut ranked: Vec<(UserId, UserStat)> = stats.into_iter().collect();
    ranked.sort_by(|(a_user, a), (b_user, b)| {
        b.total_volume()
            .cmp(&a.total_volume())
            .then_with(|| b.total_count().cmp(&a.total_count()))
            .then_with(|| a_user.cmp(b_user))
    });
    ranked.truncate(TOP_USERS);
    ranked
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(cfg!(debug_assertions))
        .init();
}
