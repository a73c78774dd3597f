//! Hyperliquid `trades` channel over WebSocket.
//!
//! See docs: <https://hyperliquid.gitbook.io/hyperliquid-docs/for-developers/api/websocket>
//!
//! ### Raw Payload Examples
//! Subscription request:
//! ```json
//! {"method": "subscribe", "subscription": {"type": "trades", "coin": "BTC"}}
//! ```
//! Subscription acknowledgement:
//! ```json
//! {"channel": "subscriptionResponse", "data": {"method": "subscribe", "subscription": {"type": "trades", "coin": "BTC"}}}
//! ```
//! Application-level keepalive: the client sends `{"method": "ping"}` and the server answers
//! `{"channel": "pong"}`. Idle connections are closed by the server after 60 seconds.

use super::{FeedConnector, FeedSession};
use crate::{config::Network, error::FeedError, trade::Instrument};
use async_trait::async_trait;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde_json::json;
use std::{collections::VecDeque, time::Duration};
use tokio::{
    net::TcpStream,
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Maximum wait for the exchange to acknowledge a subscription.
const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens Hyperliquid `trades` subscriptions.
#[derive(Debug, Clone)]
pub struct HyperliquidConnector {
    url: String,
    ping_interval: Duration,
}

impl HyperliquidConnector {
    pub fn new(network: Network, ping_interval: Duration) -> Self {
        Self {
            url: network.ws_url().to_string(),
            ping_interval,
        }
    }

    /// Connector for a custom endpoint (eg/ a local relay).
    pub fn with_url(url: &str, ping_interval: Duration) -> Result<Self, url::ParseError> {
        Ok(Self {
            url: String::from(Url::parse(url)?),
            ping_interval,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl FeedConnector for HyperliquidConnector {
    type Session = HyperliquidSession;

    async fn subscribe(&self, instrument: &Instrument) -> Result<Self::Session, FeedError> {
        let (ws_stream, _) =
            connect_async(self.url.as_str())
                .await
                .map_err(|error| FeedError::Connect {
                    url: self.url.clone(),
                    reason: error.to_string(),
                })?;
        info!(url = %self.url, %instrument, "connected to Hyperliquid WebSocket");

        let (write, read) = ws_stream.split();
        let mut ping = tokio::time::interval_at(
            Instant::now() + self.ping_interval,
            self.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut session = HyperliquidSession {
            instrument: instrument.clone(),
            write,
            read,
            ping,
            pending: VecDeque::new(),
            closed: false,
        };

        session
            .send_frame("subscribe", subscription_frame("subscribe", instrument))
            .await?;

        match tokio::time::timeout(SUBSCRIBE_ACK_TIMEOUT, session.await_ack()).await {
            Ok(Ok(())) => {
                debug!(%instrument, "trades subscription acknowledged");
                Ok(session)
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(FeedError::Connect {
                url: self.url.clone(),
                reason: format!(
                    "subscription not acknowledged within {}s",
                    SUBSCRIBE_ACK_TIMEOUT.as_secs()
                ),
            }),
        }
    }
}

/// Live Hyperliquid `trades` subscription.
pub struct HyperliquidSession {
    instrument: Instrument,
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    ping: Interval,
    /// Payloads read while waiting for the subscription acknowledgement.
    pending: VecDeque<String>,
    closed: bool,
}

impl std::fmt::Debug for HyperliquidSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperliquidSession")
            .field("instrument", &self.instrument)
            .field("pending", &self.pending.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl HyperliquidSession {
    async fn send_frame(
        &mut self,
        frame: &'static str,
        payload: serde_json::Value,
    ) -> Result<(), FeedError> {
        self.write
            .send(Message::Text(payload.to_string().into()))
            .await
            .map_err(|error| FeedError::Send {
                frame,
                reason: error.to_string(),
            })
    }

    async fn await_ack(&mut self) -> Result<(), FeedError> {
        loop {
            match read_text(&mut self.read, &self.instrument).await {
                Some(Ok(text)) => {
                    if is_subscription_ack(&text) {
                        return Ok(());
                    }
                    self.pending.push_back(text);
                }
                Some(Err(error)) => return Err(error),
                None => return Err(FeedError::Closed),
            }
        }
    }
}

#[async_trait]
impl FeedSession for HyperliquidSession {
    async fn recv(&mut self) -> Option<Result<String, FeedError>> {
        if let Some(text) = self.pending.pop_front() {
            return Some(Ok(text));
        }
        if self.closed {
            return None;
        }

        loop {
            tokio::select! {
                _ = self.ping.tick() => {}
                message = read_text(&mut self.read, &self.instrument) => return message,
            }

            if let Err(error) = self.send_frame("ping", json!({ "method": "ping" })).await {
                warn!(instrument = %self.instrument, %error, "failed to send keepalive ping");
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let unsubscribe = subscription_frame("unsubscribe", &self.instrument);
        if let Err(error) = self.send_frame("unsubscribe", unsubscribe).await {
            debug!(instrument = %self.instrument, %error, "unsubscribe frame not delivered");
        }
        if let Err(error) = self.write.close().await {
            debug!(instrument = %self.instrument, %error, "WebSocket close handshake failed");
        }
        info!(instrument = %self.instrument, "Hyperliquid session closed");
    }
}

/// Next text payload from the socket, skipping control and binary frames.
async fn read_text(
    read: &mut SplitStream<WsStream>,
    instrument: &Instrument,
) -> Option<Result<String, FeedError>> {
    loop {
        match read.next().await? {
            Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
            Ok(Message::Close(frame)) => {
                info!(%instrument, ?frame, "server closed connection");
                return Some(Err(FeedError::Closed));
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Heartbeat messages - tungstenite handles these automatically
            }
            Ok(_) => {}
            Err(error) => return Some(Err(FeedError::Transport(error.to_string()))),
        }
    }
}

fn subscription_frame(method: &str, instrument: &Instrument) -> serde_json::Value {
    json!({
        "method": method,
        "subscription": { "type": "trades", "coin": instrument.as_str() }
    })
}

fn is_subscription_ack(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| {
            value
                .get("channel")
                .and_then(|channel| channel.as_str())
                .map(|channel| channel == "subscriptionResponse")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_frame() {
        let frame = subscription_frame("subscribe", &Instrument::new("sol"));
        assert_eq!(
            frame,
            json!({"method": "subscribe", "subscription": {"type": "trades", "coin": "SOL"}})
        );
    }

    #[test]
    fn test_is_subscription_ack() {
        struct TestCase {
            input: &'static str,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: acknowledgement
                input: r#"{"channel":"subscriptionResponse","data":{"method":"subscribe","subscription":{"type":"trades","coin":"BTC"}}}"#,
                expected: true,
            },
            TestCase {
                // TC1: trade batch
                input: r#"{"channel":"trades","data":[]}"#,
                expected: false,
            },
            TestCase {
                // TC2: pong
                input: r#"{"channel":"pong"}"#,
                expected: false,
            },
            TestCase {
                // TC3: not json
                input: "Websocket connection established.",
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = is_subscription_ack(test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_connector_urls() {
        let mainnet = HyperliquidConnector::new(Network::Mainnet, Duration::from_secs(30));
        assert_eq!(mainnet.url(), "wss://api.hyperliquid.xyz/ws");

        let relay = HyperliquidConnector::with_url("ws://127.0.0.1:9001/ws", Duration::from_secs(5))
            .unwrap();
        assert_eq!(relay.url(), "ws://127.0.0.1:9001/ws");

        assert!(HyperliquidConnector::with_url("not a url", Duration::from_secs(5)).is_err());
    }
}
