use crate::{error::FeedError, trade::Instrument};
use async_trait::async_trait;
use std::sync::Arc;

/// Hyperliquid WebSocket [`FeedConnector`] implementation.
pub mod hyperliquid;

pub use hyperliquid::{HyperliquidConnector, HyperliquidSession};

/// Capability to open a trade subscription for one [`Instrument`] on the upstream feed.
///
/// Implementations are expected to return only once the subscription is live (eg/ the exchange
/// acknowledged it), so the caller may treat `Ok` as "connected".
#[async_trait]
pub trait FeedConnector: Send + Sync + 'static {
    type Session: FeedSession;

    async fn subscribe(&self, instrument: &Instrument) -> Result<Self::Session, FeedError>;
}

#[async_trait]
impl<C> FeedConnector for Arc<C>
where
    C: FeedConnector,
{
    type Session = C::Session;

    async fn subscribe(&self, instrument: &Instrument) -> Result<Self::Session, FeedError> {
        C::subscribe(self, instrument).await
    }
}

/// One live feed subscription.
///
/// Dropping a session releases the transport; [`FeedSession::close`] additionally unsubscribes
/// and performs a graceful close.
#[async_trait]
pub trait FeedSession: Send + 'static {
    /// Next raw text payload. `None` once the transport has ended.
    async fn recv(&mut self) -> Option<Result<String, FeedError>>;

    /// Unsubscribe (best effort) and close the transport.
    async fn close(&mut self);
}

/// Consumer of raw feed payloads, invoked by the message loop for every text message received.
pub trait FeedHandler: Send + Sync + 'static {
    fn handle_message(&self, raw: &str);
}
