use crate::{
    config::PulseConfig,
    error::{FeedError, SubscribeError},
    feed::{FeedConnector, FeedHandler, FeedSession},
    trade::Instrument,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    fmt::{Display, Formatter},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Bounded reconnect schedule used by the [`ConnectionManager`].
pub mod policy;

pub use policy::{AttemptOutcome, ReconnectPolicy};

/// Maximum wait for a [`FeedConnector`] to establish a subscription.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum wait for a session to unsubscribe and close gracefully.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of the feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Stale,
    Reconnecting,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Stale => "STALE",
            ConnectionStatus::Reconnecting => "RECONNECTING",
            ConnectionStatus::Failed => "FAILED",
        }
    }
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable copy of the connection state handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionStatus,
    pub instrument: Option<Instrument>,
    /// Time since the last message was received on the current subscription.
    pub last_message_age: Option<Duration>,
    /// Consecutive failed reconnect attempts in the current cycle.
    pub reconnect_count: u32,
    /// Successful reconnects since construction.
    pub total_reconnects: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ConnectionState {
    status: ConnectionStatus,
    instrument: Option<Instrument>,
    last_message: Option<Instant>,
    total_reconnects: u64,
    last_error: Option<FeedError>,
    last_error_at: Option<DateTime<Utc>>,
}

impl ConnectionState {
    fn record_error(&mut self, error: FeedError) {
        self.last_error = Some(error);
        self.last_error_at = Some(Utc::now());
    }
}

/// Running message loop of one session.
#[derive(Debug)]
struct SessionHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Signal the message loop and wait for it to close its session.
    async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(error) = self.task.await {
            warn!(%error, "feed message loop terminated abnormally");
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    policy: ReconnectPolicy,
    /// Bumped on every (re)subscribe and unsubscribe; results of superseded operations are
    /// discarded by comparing against it.
    generation: u64,
    /// A subscribe or reconnect is awaiting the connector.
    in_flight: bool,
    session: Option<SessionHandle>,
}

/// Owns the lifecycle of a single feed subscription.
///
/// Receipt of messages happens on a dedicated message loop task per session, while
/// [`ConnectionManager::check_health`] drives staleness detection and reconnects independently,
/// so a stalled transport never blocks either. The internal lock is never held across an await.
pub struct ConnectionManager<C>
where
    C: FeedConnector,
{
    connector: Arc<C>,
    handler: Arc<dyn FeedHandler>,
    heartbeat: Duration,
    health_check_interval: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl<C> std::fmt::Debug for ConnectionManager<C>
where
    C: FeedConnector,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("heartbeat", &self.heartbeat)
            .field("health_check_interval", &self.health_check_interval)
            .field("state", &self.snapshot())
            .finish()
    }
}

impl<C> ConnectionManager<C>
where
    C: FeedConnector,
{
    pub fn new(connector: Arc<C>, handler: Arc<dyn FeedHandler>, config: &PulseConfig) -> Self {
        Self {
            connector,
            handler,
            heartbeat: config.heartbeat_interval,
            health_check_interval: config.health_check_interval,
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::default(),
                policy: ReconnectPolicy::from_config(config),
                generation: 0,
                in_flight: false,
                session: None,
            })),
        }
    }

    /// Subscribe to the trades of `instrument`.
    ///
    /// Subscribing again to the active instrument is a no-op. A transport failure is recorded in
    /// the connection state (which moves to [`ConnectionStatus::Reconnecting`]) rather than
    /// returned; the health check retries it.
    pub async fn subscribe(&self, instrument: Instrument) -> Result<(), SubscribeError> {
        let generation = {
            let mut inner = self.inner.lock();
            if let Some(active) = &inner.state.instrument {
                if *active == instrument {
                    debug!(%instrument, "already subscribed, ignoring subscribe request");
                    return Ok(());
                }
                return Err(SubscribeError::AlreadySubscribed {
                    active: active.clone(),
                    requested: instrument,
                });
            }

            inner.generation += 1;
            inner.in_flight = true;
            inner.policy.reset();
            inner.state.instrument = Some(instrument.clone());
            inner.state.status = ConnectionStatus::Connecting;
            inner.generation
        };

        info!(%instrument, "subscribing to trade feed");
        let result = self.connect(&instrument).await;

        let superseded = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                result.ok()
            } else {
                inner.in_flight = false;
                match result {
                    Ok(session) => {
                        self.install_session(&mut inner, session, generation);
                        info!(%instrument, "trade feed connected");
                    }
                    Err(error) => {
                        warn!(%instrument, %error, "initial subscribe failed, will retry");
                        inner.state.record_error(error);
                        inner.state.status = ConnectionStatus::Reconnecting;
                    }
                }
                None
            }
        };

        if let Some(session) = superseded {
            close_session(session, &instrument).await;
        }
        Ok(())
    }

    /// Cancel the active subscription, stopping and awaiting its message loop. Idempotent.
    pub async fn unsubscribe(&self) {
        let (session, instrument) = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.in_flight = false;
            inner.policy.reset();
            inner.state.status = ConnectionStatus::Disconnected;
            inner.state.last_message = None;
            (inner.session.take(), inner.state.instrument.take())
        };

        if let Some(session) = session {
            session.stop().await;
        }
        if let Some(instrument) = instrument {
            info!(%instrument, "unsubscribed from trade feed");
        }
    }

    /// Perform one health-check step.
    ///
    /// * A connected feed silent for longer than the heartbeat interval becomes stale.
    /// * A stale, reconnecting or failed feed is reconnected when the [`ReconnectPolicy`]
    ///   allows it. Reaching the attempt limit marks the feed failed until the cooldown elapses.
    pub async fn check_health(&self) {
        let now = Instant::now();
        let (instrument, generation, previous, attempt) = {
            let mut inner = self.inner.lock();
            let Some(instrument) = inner.state.instrument.clone() else {
                return;
            };
            if inner.in_flight {
                return;
            }

            match inner.state.status {
                ConnectionStatus::Connected => {
                    let silence = inner
                        .state
                        .last_message
                        .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
                    if silence > self.heartbeat {
                        warn!(
                            %instrument,
                            silence_secs = silence.as_secs(),
                            heartbeat_secs = self.heartbeat.as_secs(),
                            "no trade feed message within heartbeat, marking stale"
                        );
                        inner.state.status = ConnectionStatus::Stale;
                        inner.state.record_error(FeedError::Stale(silence.as_secs()));
                    }
                    return;
                }
                ConnectionStatus::Stale
                | ConnectionStatus::Reconnecting
                | ConnectionStatus::Failed => {}
                ConnectionStatus::Disconnected | ConnectionStatus::Connecting => return,
            }

            if !inner.policy.should_retry(now) {
                return;
            }

            inner.generation += 1;
            inner.in_flight = true;
            inner.state.status = ConnectionStatus::Reconnecting;
            (
                instrument,
                inner.generation,
                inner.session.take(),
                inner.policy.attempts() + 1,
            )
        };

        if let Some(session) = previous {
            session.stop().await;
        }

        info!(%instrument, attempt, "reconnecting trade feed");
        let result = self.connect(&instrument).await;

        let superseded = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                result.ok()
            } else {
                inner.in_flight = false;
                let now = Instant::now();
                match result {
                    Ok(session) => {
                        inner.policy.record_attempt(AttemptOutcome::Success, now);
                        inner.state.total_reconnects += 1;
                        self.install_session(&mut inner, session, generation);
                        info!(
                            %instrument,
                            total_reconnects = inner.state.total_reconnects,
                            "trade feed reconnected"
                        );
                    }
                    Err(error) => {
                        inner.policy.record_attempt(AttemptOutcome::Failure, now);
                        if inner.policy.is_exhausted() {
                            error!(
                                %instrument,
                                %error,
                                attempts = inner.policy.attempts(),
                                "reconnect attempts exhausted, entering cooldown"
                            );
                            inner.state.status = ConnectionStatus::Failed;
                        } else {
                            warn!(
                                %instrument,
                                %error,
                                attempt = inner.policy.attempts(),
                                max_attempts = inner.policy.max_attempts(),
                                retry_in_secs = inner.policy.backoff(inner.policy.attempts()).as_secs(),
                                "reconnect failed"
                            );
                            inner.state.status = ConnectionStatus::Reconnecting;
                        }
                        inner.state.record_error(error);
                    }
                }
                None
            }
        };

        if let Some(session) = superseded {
            close_session(session, &instrument).await;
        }
    }

    /// Run [`ConnectionManager::check_health`] every health-check interval until `shutdown`
    /// flips to `true` or its sender is dropped.
    pub fn spawn_health_check(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(
                Instant::now() + self.health_check_interval,
                self.health_check_interval,
            );
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => break,
                            _ = self.check_health() => {}
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("connection health check stopped");
        })
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.inner.lock();
        let now = Instant::now();
        ConnectionSnapshot {
            state: inner.state.status,
            instrument: inner.state.instrument.clone(),
            last_message_age: inner
                .state
                .last_message
                .map(|at| now.saturating_duration_since(at)),
            reconnect_count: inner.policy.attempts(),
            total_reconnects: inner.state.total_reconnects,
            last_error: inner.state.last_error.as_ref().map(ToString::to_string),
            last_error_at: inner.state.last_error_at,
        }
    }

    async fn connect(&self, instrument: &Instrument) -> Result<C::Session, FeedError> {
        tokio::time::timeout(SUBSCRIBE_TIMEOUT, self.connector.subscribe(instrument))
            .await
            .unwrap_or(Err(FeedError::Timeout(SUBSCRIBE_TIMEOUT.as_secs())))
    }

    fn install_session(&self, inner: &mut Inner, session: C::Session, generation: u64) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_session(
            session,
            Arc::clone(&self.handler),
            Arc::clone(&self.inner),
            generation,
            stop_rx,
        ));

        inner.session = Some(SessionHandle { stop_tx, task });
        inner.state.status = ConnectionStatus::Connected;
        inner.state.last_message = Some(Instant::now());
    }
}

/// Message loop of one session: forwards every payload to the handler until stopped or the
/// transport ends, then closes the session.
async fn run_session<S>(
    mut session: S,
    handler: Arc<dyn FeedHandler>,
    inner: Arc<Mutex<Inner>>,
    generation: u64,
    mut stop_rx: oneshot::Receiver<()>,
) where
    S: FeedSession,
{
    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            message = session.recv() => match message {
                Some(Ok(payload)) => {
                    {
                        let mut inner = inner.lock();
                        if inner.generation == generation {
                            inner.state.last_message = Some(Instant::now());
                        }
                    }
                    handler.handle_message(&payload);
                }
                Some(Err(error)) if !error.is_terminal() => {
                    warn!(%error, "non-terminal feed error, continuing");
                }
                Some(Err(error)) => {
                    mark_session_ended(&inner, generation, error);
                    break;
                }
                None => {
                    mark_session_ended(&inner, generation, FeedError::Closed);
                    break;
                }
            }
        }
    }

    if tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await.is_err() {
        debug!("feed session close timed out");
    }
}

fn mark_session_ended(inner: &Mutex<Inner>, generation: u64, error: FeedError) {
    let mut inner = inner.lock();
    if inner.generation != generation {
        return;
    }
    if inner.state.status == ConnectionStatus::Connected {
        warn!(%error, "trade feed session ended, marking stale");
        inner.state.status = ConnectionStatus::Stale;
    }
    inner.state.record_error(error);
}

async fn close_session<S>(mut session: S, instrument: &Instrument)
where
    S: FeedSession,
{
    debug!(%instrument, "closing superseded feed session");
    if tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await.is_err() {
        debug!(%instrument, "feed session close timed out");
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::mpsc;

    /// Connector whose first `failures` subscribe calls fail, handing out channel-backed
    /// sessions afterwards.
    #[derive(Debug, Default)]
    pub struct MockConnector {
        pub failures: AtomicU32,
        pub attempts: AtomicU32,
        pub feeds: Mutex<Vec<mpsc::UnboundedSender<String>>>,
        pub closed: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl MockConnector {
        pub fn failing(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                ..Self::default()
            }
        }

        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }

        /// Push a payload into the most recent session.
        pub fn send(&self, payload: &str) {
            if let Some(tx) = self.feeds.lock().last() {
                let _ = tx.send(payload.to_string());
            }
        }

        /// End every open session from the "server" side.
        pub fn drop_feeds(&self) {
            self.feeds.lock().clear();
        }

        pub fn closed_sessions(&self) -> usize {
            self.closed
                .lock()
                .iter()
                .filter(|closed| closed.load(Ordering::SeqCst))
                .count()
        }
    }

    #[derive(Debug)]
    pub struct MockSession {
        rx: mpsc::UnboundedReceiver<String>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl FeedConnector for MockConnector {
        type Session = MockSession;

        async fn subscribe(&self, instrument: &Instrument) -> Result<Self::Session, FeedError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(FeedError::Connect {
                    url: "mock://feed".to_string(),
                    reason: format!("refused {instrument}"),
                });
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let closed = Arc::new(AtomicBool::new(false));
            self.feeds.lock().push(tx);
            self.closed.lock().push(Arc::clone(&closed));
            Ok(MockSession { rx, closed })
        }
    }

    #[async_trait]
    impl FeedSession for MockSession {
        async fn recv(&mut self) -> Option<Result<String, FeedError>> {
            self.rx.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Debug, Default)]
    pub struct RecordingHandler {
        pub messages: Mutex<Vec<String>>,
    }

    impl FeedHandler for RecordingHandler {
        fn handle_message(&self, raw: &str) {
            self.messages.lock().push(raw.to_string());
        }
    }
}
