use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};

use crate::config::TargetServer;

/// One logical byte stream multiplexed over a transport session.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

pub type ChannelStream = Box<dyn Duplex>;

/// A channel offered by the remote side of a session, delivered to whoever
/// subscribed to its bind port via [`TransportSession::incoming_on_port`].
pub struct IncomingChannel {
    pub origin_host: String,
    pub origin_port: u16,
    pub stream: ChannelStream,
}

impl std::fmt::Debug for IncomingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingChannel")
            .field("origin_host", &self.origin_host)
            .field("origin_port", &self.origin_port)
            .finish()
    }
}

/// Channel-open failure reason codes, as reported by SSH-style transports.
pub mod open_reason {
    pub const ADMINISTRATIVELY_PROHIBITED: u32 = 1;
    pub const CONNECT_FAILED: u32 = 2;
    pub const UNKNOWN_CHANNEL_TYPE: u32 = 3;
    pub const RESOURCE_SHORTAGE: u32 = 4;
}

/// Errors surfaced by the transport contract.
///
/// `Clone` is required: the pool caches a lease's fallback outcome so
/// concurrent operations observe the same result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel open failed (reason {code}): {message}")]
    ChannelOpen { code: u32, message: String },
    #[error("transport session closed")]
    SessionClosed,
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("{0}")]
    Io(String),
}

impl TransportError {
    pub fn io(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// An authenticated, multiplexed session capable of carrying independent
/// byte-stream channels. Implementations are supplied by the embedding
/// application; the tunnel core never performs the handshake itself.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Open an outbound channel to an arbitrary remote endpoint.
    async fn open_direct_channel(
        &self,
        host: &str,
        port: u16,
    ) -> Result<ChannelStream, TransportError>;

    /// Ask the remote side to listen on `bind_addr:bind_port` and offer the
    /// accepted connections back as incoming channels. Port 0 requests a
    /// server-allocated port; the effective port is returned.
    async fn request_remote_forward(
        &self,
        bind_addr: &str,
        bind_port: u16,
    ) -> Result<u16, TransportError>;

    async fn cancel_remote_forward(
        &self,
        bind_addr: &str,
        bind_port: u16,
    ) -> Result<(), TransportError>;

    /// Subscribe to channels the remote side offers for `bind_port`.
    /// Dropping the receiver unregisters the subscription.
    fn incoming_on_port(&self, bind_port: u16) -> mpsc::UnboundedReceiver<IncomingChannel>;

    /// Close notification. Fires once when the session goes away, whether
    /// disposed locally or dropped by the peer.
    fn closed(&self) -> broadcast::Receiver<()>;

    fn is_closed(&self) -> bool;

    /// Idempotent teardown of the session and everything it carries.
    async fn dispose(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Establish and authenticate a new session. May prompt for credentials
    /// or host-key trust out of band, so callers must tolerate long awaits.
    async fn connect(
        &self,
        server: &TargetServer,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}
