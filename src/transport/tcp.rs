use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{TransportError, TransportResult};
use crate::transport::wire::{self, Frame, FrameKind};
use crate::transport::{BinaryHandler, Messenger, ReplySender, TransportStats};

/// Configuration for TCP messengers
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Maximum frame size in bytes
    pub max_frame_size: usize,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024, // 16 MB
            connect_timeout: Duration::from_secs(5),
            nodelay: true,
        }
    }
}

impl TcpConfig {
    /// Create a new configuration with custom max frame size
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

/// State shared between a TCP messenger and its connection tasks.
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Bytes>>>,
    handlers: RwLock<HashMap<String, Arc<dyn BinaryHandler>>>,
    connected: AtomicBool,
    stats: Mutex<TransportStats>,
    shutdown: CancellationToken,
}

impl Shared {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(true),
            stats: Mutex::new(TransportStats::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Tear the connection down once. Pending replies fail with
    /// `ConnectionClosed` when their slots are dropped here; the flag is
    /// swapped first so `send` cannot slip a new slot in after the clear.
    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.shutdown.cancel();
            self.pending.lock().clear();
        }
    }
}

/// Removes a pending reply slot when the awaiting send is dropped,
/// so a late reply to it is discarded.
struct PendingCleanup<'a> {
    id: u64,
    shared: &'a Arc<Shared>,
}

impl Drop for PendingCleanup<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

/// TCP messenger for network channel communication
///
/// Each connection runs three tasks: a reader that routes reply frames to
/// pending sends and queues message frames, a dispatcher that runs channel
/// handlers sequentially in arrival order, and a writer that serializes
/// outbound frames. Handlers may send on the same connection without
/// blocking the reader. A reply the writer cannot fit under the frame
/// limit goes out as an empty reply instead of being dropped.
pub struct TcpMessenger {
    config: TcpConfig,
    peer_addr: SocketAddr,
    next_id: AtomicU64,
    writer: mpsc::UnboundedSender<Frame>,
    shared: Arc<Shared>,
}

impl TcpMessenger {
    /// Create a new TCP messenger by connecting to an address
    pub async fn connect(addr: SocketAddr, config: TcpConfig) -> TransportResult<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionFailed {
                name: addr.to_string(),
                reason: format!(
                    "Connect timed out after {}ms",
                    config.connect_timeout.as_millis()
                ),
            })?
            .map_err(|e| TransportError::ConnectionFailed {
                name: addr.to_string(),
                reason: e.to_string(),
            })?;

        Self::from_stream(stream, config)
    }

    /// Create a new TCP messenger from an existing stream
    pub fn from_stream(stream: TcpStream, config: TcpConfig) -> TransportResult<Self> {
        // Disable Nagle's algorithm for lower latency
        if config.nodelay {
            stream.set_nodelay(true).map_err(|e| {
                TransportError::Protocol(format!("Failed to set TCP_NODELAY: {}", e))
            })?;
        }

        let peer_addr = stream
            .peer_addr()
            .map_err(|e| TransportError::Protocol(format!("Failed to get peer address: {}", e)))?;

        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new());

        tokio::spawn(read_loop(
            read_half,
            shared.clone(),
            dispatch_tx,
            config.max_frame_size,
        ));
        tokio::spawn(dispatch_loop(dispatch_rx, shared.clone(), writer_tx.clone()));
        tokio::spawn(writer_loop(
            write_half,
            writer_rx,
            shared.clone(),
            config.max_frame_size,
        ));

        Ok(Self {
            config,
            peer_addr,
            next_id: AtomicU64::new(1),
            writer: writer_tx,
            shared,
        })
    }

    /// Get the peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

/// Reads frames off the socket. Replies settle pending sends here; named
/// messages go to the dispatch task so a slow handler never stalls reply
/// routing.
async fn read_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    dispatch: mpsc::UnboundedSender<Frame>,
    max_frame_size: usize,
) {
    loop {
        let mut len_bytes = [0u8; 4];
        let read = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            read = reader.read_exact(&mut len_bytes) => read,
        };
        if read.is_err() {
            break;
        }

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > max_frame_size {
            tracing::warn!(size = len, max = max_frame_size, "oversized frame from peer");
            shared.stats.lock().recv_errors += 1;
            break;
        }

        let mut buffer = vec![0u8; len];
        let read = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            read = reader.read_exact(&mut buffer) => read,
        };
        if read.is_err() {
            break;
        }

        let frame = match Frame::decode(&buffer[..]) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "malformed frame from peer");
                shared.stats.lock().recv_errors += 1;
                break;
            }
        };

        {
            let mut stats = shared.stats.lock();
            stats.bytes_received += len as u64 + 4;
            if frame.kind == FrameKind::Message {
                stats.messages_received += 1;
            }
        }

        match frame.kind {
            FrameKind::Reply => {
                let waiter = shared.pending.lock().remove(&frame.id);
                if let Some(tx) = waiter {
                    let _ = tx.send(frame.payload);
                }
                // Unknown ids were cancelled locally; the late reply is dropped.
            }
            FrameKind::Message => {
                if dispatch.send(frame).is_err() {
                    break;
                }
            }
        }
    }

    shared.disconnect();
}

/// Runs channel handlers for inbound messages, one at a time in arrival
/// order. Replies are forwarded to the writer as handlers settle them.
async fn dispatch_loop(
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
    writer: mpsc::UnboundedSender<Frame>,
) {
    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let handler = shared.handlers.read().get(&frame.channel).cloned();
        let Frame {
            id,
            channel,
            payload,
            ..
        } = frame;

        match handler {
            Some(handler) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let writer = writer.clone();
                // Handlers may keep the reply route beyond this call. A
                // dropped route sends nothing and the peer keeps waiting.
                tokio::spawn(async move {
                    if let Ok(payload) = reply_rx.await {
                        let _ = writer.send(Frame::reply(id, payload));
                    }
                });
                let reply = ReplySender::new(channel, reply_tx);
                handler.on_message(payload, reply).await;
            }
            None => {
                // No handler: answer empty so the peer resolves.
                let _ = writer.send(Frame::reply(id, Bytes::new()));
            }
        }
    }
}

/// Encode a frame and enforce the outbound size limit.
fn encode_within(frame: &Frame, max_frame_size: usize) -> TransportResult<BytesMut> {
    let encoded = frame.encode()?;
    if encoded.len() > max_frame_size {
        return Err(TransportError::MessageTooLarge {
            size: encoded.len(),
            max: max_frame_size,
        });
    }
    Ok(encoded)
}

/// Serializes outbound frames onto the socket with a length prefix.
///
/// An unwritable frame still settles its exchange: a failed message frame
/// drops its pending slot so the local sender resolves, and a failed reply
/// goes out as an empty reply so the remote sender resolves.
async fn writer_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
    max_frame_size: usize,
) {
    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let is_message = frame.kind == FrameKind::Message;
        let encoded = match encode_within(&frame, max_frame_size) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(
                    id = frame.id,
                    channel = %frame.channel,
                    error = %e,
                    "unwritable outbound frame"
                );
                shared.stats.lock().send_errors += 1;
                match frame.kind {
                    FrameKind::Message => {
                        // Drop the sender's slot so it resolves instead of
                        // waiting on a frame that never left.
                        shared.pending.lock().remove(&frame.id);
                        continue;
                    }
                    // Losing a reply would leave the remote sender waiting
                    // forever; an empty reply still resolves it.
                    FrameKind::Reply => {
                        match encode_within(&Frame::reply(frame.id, Bytes::new()), max_frame_size)
                        {
                            Ok(empty) => empty,
                            Err(_) => continue,
                        }
                    }
                }
            }
        };

        let len_bytes = (encoded.len() as u32).to_be_bytes();
        if writer.write_all(&len_bytes).await.is_err() {
            break;
        }
        if writer.write_all(&encoded).await.is_err() {
            break;
        }

        let mut stats = shared.stats.lock();
        stats.bytes_sent += encoded.len() as u64 + 4;
        if is_message {
            stats.messages_sent += 1;
        }
    }

    shared.disconnect();
}

#[async_trait]
impl Messenger for TcpMessenger {
    async fn send(&self, channel: &str, payload: Bytes) -> TransportResult<Bytes> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        // Reject before queueing anything the wire format cannot carry.
        if channel.len() > u16::MAX as usize {
            return Err(TransportError::Protocol(format!(
                "Channel name too long: {} bytes",
                channel.len()
            )));
        }

        let frame_size = wire::HEADER_SIZE + channel.len() + payload.len();
        if frame_size > self.config.max_frame_size {
            return Err(TransportError::MessageTooLarge {
                size: frame_size,
                max: self.config.max_frame_size,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            // Disconnect swaps the flag and then clears pending under this
            // lock, so the slot either lands before the clear or the closed
            // state is observed here.
            let mut pending = self.shared.pending.lock();
            if !self.shared.connected.load(Ordering::Acquire) {
                return Err(TransportError::NotConnected);
            }
            pending.insert(id, reply_tx);
        }
        let _cleanup = PendingCleanup {
            id,
            shared: &self.shared,
        };

        let frame = Frame::message(id, channel, payload);
        if self.writer.send(frame).is_err() {
            return Err(TransportError::NotConnected);
        }

        reply_rx
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn set_handler(&self, channel: &str, handler: Option<Arc<dyn BinaryHandler>>) {
        let mut handlers = self.shared.handlers.write();
        match handler {
            Some(handler) => {
                handlers.insert(channel.to_string(), handler);
            }
            None => {
                handlers.remove(channel);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    async fn close(&self) -> TransportResult<()> {
        self.shared.disconnect();
        Ok(())
    }

    fn stats(&self) -> Option<TransportStats> {
        Some(self.shared.stats.lock().clone())
    }

    fn name(&self) -> &str {
        "tcp"
    }
}

impl Drop for TcpMessenger {
    fn drop(&mut self) {
        self.shared.disconnect();
    }
}

impl std::fmt::Debug for TcpMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpMessenger")
            .field("peer_addr", &self.peer_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// TCP listener for accepting incoming messenger connections
pub struct TcpMessengerListener {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpMessengerListener {
    /// Bind to a socket address and listen for incoming connections
    pub async fn bind(addr: SocketAddr, config: TcpConfig) -> TransportResult<Self> {
        let listener =
            TcpListener::bind(addr)
                .await
                .map_err(|e| TransportError::ConnectionFailed {
                    name: addr.to_string(),
                    reason: format!("Failed to bind: {}", e),
                })?;

        Ok(Self { listener, config })
    }

    /// Get the local address the listener is bound to
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| TransportError::Protocol(format!("Failed to get local address: {}", e)))
    }

    /// Accept an incoming connection
    pub async fn accept(&self) -> TransportResult<TcpMessenger> {
        let (stream, _addr) =
            self.listener
                .accept()
                .await
                .map_err(|e| TransportError::ConnectionFailed {
                    name: "tcp_listener".to_string(),
                    reason: format!("Failed to accept connection: {}", e),
                })?;

        TcpMessenger::from_stream(stream, self.config.clone())
    }
}
