use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::{TransportError, TransportResult};

pub mod local;
pub mod tcp;
pub(crate) mod wire;

/// Messenger trait for abstracting the byte transport under channels
///
/// A messenger moves opaque payloads between two peers and routes inbound
/// payloads to per-channel handlers. Every send is answered: when the
/// receiving side has no handler for the channel, the messenger itself
/// replies with an empty payload so the sender resolves.
#[async_trait]
pub trait Messenger: Send + Sync + Debug {
    /// Send a payload on a named channel and wait for the peer's reply
    ///
    /// An empty reply payload means the peer answered with no content.
    async fn send(&self, channel: &str, payload: Bytes) -> TransportResult<Bytes>;

    /// Install or clear the inbound handler for a named channel
    ///
    /// `Some` replaces any previous handler, `None` removes it. Replies
    /// already in flight are not affected.
    fn set_handler(&self, channel: &str, handler: Option<Arc<dyn BinaryHandler>>);

    /// Check if the messenger can currently reach its peer
    fn is_connected(&self) -> bool;

    /// Close the messenger
    async fn close(&self) -> TransportResult<()>;

    /// Get messenger statistics
    fn stats(&self) -> Option<TransportStats> {
        None
    }

    /// Get messenger name/identifier
    fn name(&self) -> &str {
        "unknown"
    }
}

/// Handler for inbound payloads on one named channel
#[async_trait]
pub trait BinaryHandler: Send + Sync {
    /// Called once per inbound message. The reply route settles the
    /// sender's pending future when sent or dropped.
    async fn on_message(&self, payload: Bytes, reply: ReplySender);
}

/// Single-use route back to a waiting sender
///
/// Consumed by sending. Dropping it without sending leaves the outcome to
/// the transport: in-process pairs report the closed route to the sender,
/// remote peers keep waiting.
pub struct ReplySender {
    channel: String,
    tx: oneshot::Sender<Bytes>,
}

impl ReplySender {
    pub fn new(channel: impl Into<String>, tx: oneshot::Sender<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            tx,
        }
    }

    /// Name of the channel this reply belongs to
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Send the reply payload
    pub fn send(self, payload: Bytes) -> TransportResult<()> {
        self.tx
            .send(payload)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send an empty reply, the no-content answer
    pub fn send_empty(self) -> TransportResult<()> {
        self.send(Bytes::new())
    }
}

impl Debug for ReplySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySender")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Statistics collected by messenger implementations
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, other: &TransportStats) {
        self.messages_sent += other.messages_sent;
        self.messages_received += other.messages_received;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.send_errors += other.send_errors;
        self.recv_errors += other.recv_errors;
    }
}

impl std::fmt::Display for TransportStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Messenger Statistics:")?;
        writeln!(f, "  Messages sent:     {}", self.messages_sent)?;
        writeln!(f, "  Messages received: {}", self.messages_received)?;
        writeln!(f, "  Bytes sent:        {}", self.bytes_sent)?;
        writeln!(f, "  Bytes received:    {}", self.bytes_received)?;
        writeln!(f, "  Send errors:       {}", self.send_errors)?;
        writeln!(f, "  Receive errors:    {}", self.recv_errors)?;
        Ok(())
    }
}

#[async_trait]
impl<T: Messenger + ?Sized> Messenger for Arc<T> {
    async fn send(&self, channel: &str, payload: Bytes) -> TransportResult<Bytes> {
        (**self).send(channel, payload).await
    }

    fn set_handler(&self, channel: &str, handler: Option<Arc<dyn BinaryHandler>>) {
        (**self).set_handler(channel, handler)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn close(&self) -> TransportResult<()> {
        (**self).close().await
    }

    fn stats(&self) -> Option<TransportStats> {
        (**self).stats()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[async_trait]
impl<T: Messenger + ?Sized> Messenger for Box<T> {
    async fn send(&self, channel: &str, payload: Bytes) -> TransportResult<Bytes> {
        (**self).send(channel, payload).await
    }

    fn set_handler(&self, channel: &str, handler: Option<Arc<dyn BinaryHandler>>) {
        (**self).set_handler(channel, handler)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn close(&self) -> TransportResult<()> {
        (**self).close().await
    }

    fn stats(&self) -> Option<TransportStats> {
        (**self).stats()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
