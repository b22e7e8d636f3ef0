use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use crate::error::{TransportError, TransportResult};
use crate::transport::{BinaryHandler, Messenger, ReplySender, TransportStats};

const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Configuration for in-process messenger pairs
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Depth of each endpoint's delivery queue
    pub queue_capacity: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl LocalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// One named message in flight between the two endpoints.
struct Delivery {
    channel: String,
    payload: Bytes,
    reply_tx: oneshot::Sender<Bytes>,
}

/// In-process messenger connecting two endpoints over tokio queues.
///
/// `create_pair` returns both ends. What one end sends arrives at the
/// other end's handlers; each end dispatches its inbound traffic on its
/// own task, in arrival order. Dropping or closing an endpoint stops its
/// dispatch and fails subsequent sends from the peer.
pub struct LocalMessenger {
    name: String,
    outbound: mpsc::Sender<Delivery>,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn BinaryHandler>>>>,
    shutdown: CancellationToken,
    stats: Arc<Mutex<TransportStats>>,
}

impl LocalMessenger {
    /// Create a connected pair of endpoints.
    ///
    /// Spawns one dispatch task per endpoint, so this must run inside a
    /// tokio runtime.
    pub fn create_pair(name: &str, config: LocalConfig) -> (Self, Self) {
        let capacity = config.queue_capacity.max(1);
        let (tx_ab, rx_ab) = mpsc::channel(capacity);
        let (tx_ba, rx_ba) = mpsc::channel(capacity);

        let a = Self::new(format!("{}-a", name), tx_ab);
        let b = Self::new(format!("{}-b", name), tx_ba);

        tokio::spawn(dispatch_loop(
            rx_ba,
            a.handlers.clone(),
            a.stats.clone(),
            a.shutdown.clone(),
        ));
        tokio::spawn(dispatch_loop(
            rx_ab,
            b.handlers.clone(),
            b.stats.clone(),
            b.shutdown.clone(),
        ));

        (a, b)
    }

    fn new(name: String, outbound: mpsc::Sender<Delivery>) -> Self {
        Self {
            name,
            outbound,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            stats: Arc::new(Mutex::new(TransportStats::new())),
        }
    }
}

/// Consumes one endpoint's inbound queue and runs its handlers in order.
async fn dispatch_loop(
    mut inbound: mpsc::Receiver<Delivery>,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn BinaryHandler>>>>,
    stats: Arc<Mutex<TransportStats>>,
    shutdown: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            delivery = inbound.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        {
            let mut stats = stats.lock();
            stats.messages_received += 1;
            stats.bytes_received += delivery.payload.len() as u64;
        }

        let handler = handlers.read().get(&delivery.channel).cloned();
        let Delivery {
            channel,
            payload,
            reply_tx,
        } = delivery;
        let reply = ReplySender::new(channel, reply_tx);

        match handler {
            Some(handler) => handler.on_message(payload, reply).await,
            None => {
                // No handler: answer empty so the peer still resolves.
                let _ = reply.send_empty();
            }
        }
    }
}

#[async_trait]
impl Messenger for LocalMessenger {
    async fn send(&self, channel: &str, payload: Bytes) -> TransportResult<Bytes> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::NotConnected);
        }

        let payload_len = payload.len() as u64;
        let (reply_tx, reply_rx) = oneshot::channel();
        let delivery = Delivery {
            channel: channel.to_string(),
            payload,
            reply_tx,
        };

        if self.outbound.send(delivery).await.is_err() {
            self.stats.lock().send_errors += 1;
            return Err(TransportError::NotConnected);
        }

        {
            let mut stats = self.stats.lock();
            stats.messages_sent += 1;
            stats.bytes_sent += payload_len;
        }

        reply_rx
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn set_handler(&self, channel: &str, handler: Option<Arc<dyn BinaryHandler>>) {
        let mut handlers = self.handlers.write();
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
        !self.shutdown.is_cancelled() && !self.outbound.is_closed()
    }

    async fn close(&self) -> TransportResult<()> {
        self.shutdown.cancel();
        Ok(())
    }

    fn stats(&self) -> Option<TransportStats> {
        Some(self.stats.lock().clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LocalMessenger {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for LocalMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMessenger")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}
