//! Named message channels with codec-defined message types.

pub mod handler;
pub mod response;

pub use handler::{FnMessageHandler, MessageHandler};
pub use response::ResponseHandle;

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

use crate::codec::MessageCodec;
use crate::error::{ChannelError, Result};
use crate::transport::{BinaryHandler, Messenger, ReplySender};

/// A named bidirectional message channel.
///
/// A channel binds a messenger, a channel name and a codec at construction
/// and never changes them. Construction performs no transport activity;
/// traffic starts when a handler is installed or a message is sent. Clones
/// share the same binding.
///
/// Any number of channels may use the same name on a messenger. The last
/// handler installed for a name wins.
pub struct MessageChannel<M: Messenger, C: MessageCodec> {
    inner: Arc<ChannelInner<M, C>>,
}

struct ChannelInner<M: Messenger, C: MessageCodec> {
    messenger: M,
    name: String,
    codec: C,
    registered: AtomicBool,
}

impl<M: Messenger, C: MessageCodec> Drop for ChannelInner<M, C> {
    fn drop(&mut self) {
        if self.registered.load(Ordering::Acquire) {
            self.messenger.set_handler(&self.name, None);
        }
    }
}

impl<M: Messenger, C: MessageCodec> Clone for MessageChannel<M, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M, C> MessageChannel<M, C>
where
    M: Messenger + 'static,
    C: MessageCodec + 'static,
{
    /// Create a channel bound to `messenger`, `name` and `codec`.
    pub fn new(messenger: M, name: impl Into<String>, codec: C) -> Self {
        let name = name.into();
        debug_assert!(!name.is_empty(), "channel name must not be empty");
        Self {
            inner: Arc::new(ChannelInner {
                messenger,
                name,
                codec,
                registered: AtomicBool::new(false),
            }),
        }
    }

    /// Name this channel is bound to.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Codec this channel is bound to.
    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    /// Messenger this channel is bound to.
    pub fn messenger(&self) -> &M {
        &self.inner.messenger
    }

    /// Install or clear this channel's inbound message handler.
    ///
    /// `Some` replaces any handler currently registered for the name,
    /// including one installed through another channel; `None` deregisters.
    /// Messages arriving while no handler is installed are answered with no
    /// content. Replacing a handler does not disturb reply handles already
    /// handed out.
    pub fn set_message_handler(&self, handler: Option<Arc<dyn MessageHandler<M, C>>>) {
        match handler {
            Some(handler) => {
                let dispatcher = ChannelDispatcher {
                    inner: Arc::downgrade(&self.inner),
                    handler,
                };
                self.inner
                    .messenger
                    .set_handler(&self.inner.name, Some(Arc::new(dispatcher)));
                self.inner.registered.store(true, Ordering::Release);
            }
            None => {
                self.inner.messenger.set_handler(&self.inner.name, None);
                self.inner.registered.store(false, Ordering::Release);
            }
        }
    }

    /// Install an async closure as this channel's message handler.
    pub fn set_message_handler_fn<F, Fut>(&self, func: F)
    where
        F: Fn(MessageChannel<M, C>, C::Value, ResponseHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.set_message_handler(Some(Arc::new(FnMessageHandler::new(func))));
    }

    /// Answer an inbound message through its reply handle.
    ///
    /// `None` answers with no content. Encoding failure leaves the handle
    /// usable for another attempt. A handle answers exactly once; reuse
    /// fails with `InvalidHandle` and touches no transport.
    pub fn respond(&self, handle: &ResponseHandle, message: Option<&C::Value>) -> Result<()> {
        if handle.is_consumed() {
            return Err(ChannelError::InvalidHandle);
        }

        let payload = match message {
            Some(message) => Bytes::from(self.inner.codec.encode(message)?),
            None => Bytes::new(),
        };

        let reply = match handle.take() {
            Some(reply) => reply,
            None => return Err(ChannelError::InvalidHandle),
        };

        reply.send(payload)?;
        Ok(())
    }

    /// Send a message and wait for the peer's reply.
    ///
    /// `Ok(None)` means the peer answered with no content, which is also
    /// what a missing or failing handler on the peer produces. Encoding
    /// failure fails the call before anything reaches the transport. There
    /// is no implicit timeout.
    pub async fn send(&self, message: &C::Value) -> Result<Option<C::Value>> {
        let payload = Bytes::from(self.inner.codec.encode(message)?);
        let reply = self.inner.messenger.send(&self.inner.name, payload).await?;
        self.decode_reply(reply)
    }

    /// Send a message, abandoning the wait when `cancel` fires.
    ///
    /// Cancellation settles this call with `ChannelError::Cancelled`; a
    /// reply that still arrives is discarded. A token cancelled before the
    /// call skips the transport entirely.
    pub async fn send_with_cancellation(
        &self,
        message: &C::Value,
        cancel: &CancellationToken,
    ) -> Result<Option<C::Value>> {
        if cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }

        let payload = Bytes::from(self.inner.codec.encode(message)?);
        tokio::select! {
            reply = self.inner.messenger.send(&self.inner.name, payload) => {
                self.decode_reply(reply?)
            }
            _ = cancel.cancelled() => Err(ChannelError::Cancelled),
        }
    }

    fn decode_reply(&self, reply: Bytes) -> Result<Option<C::Value>> {
        if reply.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.inner.codec.decode(&reply)?))
    }
}

impl<M: Messenger, C: MessageCodec> std::fmt::Debug for MessageChannel<M, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("name", &self.inner.name)
            .field("codec", &self.inner.codec)
            .field("messenger", &self.inner.messenger.name())
            .finish()
    }
}

/// Bridges the messenger's binary interface to the channel's decoded
/// handler. Holds the channel weakly so an installed handler never keeps
/// the channel alive.
struct ChannelDispatcher<M: Messenger, C: MessageCodec> {
    inner: Weak<ChannelInner<M, C>>,
    handler: Arc<dyn MessageHandler<M, C>>,
}

#[async_trait]
impl<M, C> BinaryHandler for ChannelDispatcher<M, C>
where
    M: Messenger + 'static,
    C: MessageCodec + 'static,
{
    async fn on_message(&self, payload: Bytes, reply: ReplySender) {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => {
                // Channel dropped; behave as if no handler were installed.
                let _ = reply.send_empty();
                return;
            }
        };
        let channel = MessageChannel { inner };

        let message = match channel.inner.codec.decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    channel = %channel.inner.name,
                    error = %e,
                    "failed to decode inbound message"
                );
                // Malformed input still gets an answer so the peer resolves.
                let _ = reply.send_empty();
                return;
            }
        };

        let handle = ResponseHandle::new(reply);
        self.handler.on_message(channel, message, handle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{StandardCodec, StringCodec};
    use crate::transport::local::{LocalConfig, LocalMessenger};
    use crate::value::Value;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    fn messenger_pair() -> (Arc<LocalMessenger>, Arc<LocalMessenger>) {
        let (a, b) = LocalMessenger::create_pair("test", LocalConfig::default());
        (Arc::new(a), Arc::new(b))
    }

    #[derive(Debug, Clone, Copy, Default)]
    struct FlakyCodec;

    impl MessageCodec for FlakyCodec {
        type Value = String;

        fn encode(&self, message: &String) -> Result<Vec<u8>> {
            if message == "unencodable" {
                return Err(ChannelError::Encode("rejected by codec".to_string()));
            }
            Ok(message.as_bytes().to_vec())
        }

        fn decode(&self, data: &[u8]) -> Result<String> {
            String::from_utf8(data.to_vec()).map_err(|e| ChannelError::Decode(e.to_string()))
        }
    }

    struct GarbageReply;

    #[async_trait]
    impl BinaryHandler for GarbageReply {
        async fn on_message(&self, _payload: Bytes, reply: ReplySender) {
            let _ = reply.send(Bytes::from_static(&[0xFF, 0xFE]));
        }
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a, "greet", StringCodec);
        let receiver = MessageChannel::new(b, "greet", StringCodec);

        receiver.set_message_handler_fn(|channel, message: String, reply| async move {
            let answer = format!("hello {}", message);
            channel.respond(&reply, Some(&answer)).unwrap();
        });

        let reply = sender.send(&"world".to_string()).await.unwrap();
        assert_eq!(reply, Some("hello world".to_string()));
    }

    #[tokio::test]
    async fn test_construction_registers_nothing() {
        let (a, b) = messenger_pair();
        let _quiet = MessageChannel::new(b.clone(), "present", StringCodec);

        // Nothing was installed just by constructing the channel.
        let reply = a.send("present", Bytes::from_static(b"ping")).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_send_without_handler_resolves_empty() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a, "quiet", StringCodec);
        let _receiver = MessageChannel::new(b, "quiet", StringCodec);

        let reply = sender.send(&"anyone?".to_string()).await.unwrap();
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn test_cleared_handler_resolves_empty() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a, "toggle", StringCodec);
        let receiver = MessageChannel::new(b, "toggle", StringCodec);

        receiver.set_message_handler_fn(|channel, message: String, reply| async move {
            channel.respond(&reply, Some(&message)).unwrap();
        });
        assert_eq!(
            sender.send(&"first".to_string()).await.unwrap(),
            Some("first".to_string())
        );

        receiver.set_message_handler(None);
        assert_eq!(sender.send(&"second".to_string()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_respond_twice_fails() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a, "once", StringCodec);
        let receiver = MessageChannel::new(b, "once", StringCodec);

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        receiver.set_message_handler_fn(move |channel, message: String, reply| {
            let seen_tx = seen_tx.clone();
            async move {
                let first = channel.respond(&reply, Some(&message));
                let second = channel.respond(&reply, Some(&message));
                let _ = seen_tx.send((first, second));
            }
        });

        let reply = sender.send(&"ping".to_string()).await.unwrap();
        assert_eq!(reply, Some("ping".to_string()));

        let (first, second) = seen_rx.recv().await.unwrap();
        assert!(first.is_ok());
        assert!(matches!(second, Err(ChannelError::InvalidHandle)));
    }

    #[tokio::test]
    async fn test_undecodable_message_answered_empty() {
        let (a, b) = messenger_pair();
        let receiver = MessageChannel::new(b, "values", StandardCodec);

        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        receiver.set_message_handler_fn(move |channel, _message: Value, reply| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                channel.respond(&reply, None).unwrap();
            }
        });

        // Bytes that do not decode as a value.
        let reply = a
            .send("values", Bytes::from_static(&[0xFF, 0xFE]))
            .await
            .unwrap();
        assert!(reply.is_empty());
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_undecodable_reply_fails_send() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a, "garbage", StandardCodec);

        b.set_handler("garbage", Some(Arc::new(GarbageReply)));

        let result = sender.send(&Value::from("hello")).await;
        assert!(matches!(result, Err(ChannelError::Decode(_))));
    }

    #[tokio::test]
    async fn test_encode_failure_sends_nothing() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a.clone(), "flaky", FlakyCodec);
        let _receiver = MessageChannel::new(b, "flaky", FlakyCodec);

        let result = sender.send(&"unencodable".to_string()).await;
        assert!(matches!(result, Err(ChannelError::Encode(_))));
        assert_eq!(a.stats().unwrap().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_respond_encode_failure_keeps_handle_usable() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a, "retry", FlakyCodec);
        let receiver = MessageChannel::new(b, "retry", FlakyCodec);

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        receiver.set_message_handler_fn(move |channel, _message: String, reply| {
            let seen_tx = seen_tx.clone();
            async move {
                let failed = channel.respond(&reply, Some(&"unencodable".to_string()));
                let still_usable = !reply.is_consumed();
                let retried = channel.respond(&reply, Some(&"recovered".to_string()));
                let _ = seen_tx.send((failed, still_usable, retried));
            }
        });

        let reply = sender.send(&"go".to_string()).await.unwrap();
        assert_eq!(reply, Some("recovered".to_string()));

        let (failed, still_usable, retried) = seen_rx.recv().await.unwrap();
        assert!(matches!(failed, Err(ChannelError::Encode(_))));
        assert!(still_usable);
        assert!(retried.is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_settles_pending_send() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a, "slow", StringCodec);
        let receiver = MessageChannel::new(b, "slow", StringCodec);

        let (stash_tx, mut stash_rx) = mpsc::unbounded_channel();
        receiver.set_message_handler_fn(move |_channel, _message: String, reply| {
            let stash_tx = stash_tx.clone();
            async move {
                // Keep the reply open so the sender stays pending.
                let _ = stash_tx.send(reply);
            }
        });

        let cancel = CancellationToken::new();
        let send_cancel = cancel.clone();
        let sending = {
            let sender = sender.clone();
            tokio::spawn(async move {
                sender
                    .send_with_cancellation(&"wait".to_string(), &send_cancel)
                    .await
            })
        };

        // The handler has the message and is holding the reply open.
        let _held_reply = stash_rx.recv().await.unwrap();
        cancel.cancel();

        let result = sending.await.unwrap();
        assert!(matches!(result, Err(ChannelError::Cancelled)));
    }

    #[tokio::test]
    async fn test_late_reply_after_cancellation_discarded() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a, "stale", StringCodec);
        let receiver = MessageChannel::new(b, "stale", StringCodec);

        let (stash_tx, mut stash_rx) = mpsc::unbounded_channel();
        receiver.set_message_handler_fn(move |channel, message: String, reply| {
            let stash_tx = stash_tx.clone();
            async move {
                if message == "hold" {
                    let _ = stash_tx.send((channel, reply));
                } else {
                    channel.respond(&reply, Some(&message)).unwrap();
                }
            }
        });

        let cancel = CancellationToken::new();
        let send_cancel = cancel.clone();
        let sending = {
            let sender = sender.clone();
            tokio::spawn(async move {
                sender
                    .send_with_cancellation(&"hold".to_string(), &send_cancel)
                    .await
            })
        };

        let (held_channel, held_reply) = stash_rx.recv().await.unwrap();
        cancel.cancel();
        let result = sending.await.unwrap();
        assert!(matches!(result, Err(ChannelError::Cancelled)));

        // The cancelled sender's reply route is gone; answering now fails
        // cleanly and consumes the handle.
        let late = held_channel.respond(&held_reply, Some(&"too late".to_string()));
        assert!(matches!(late, Err(ChannelError::ConnectionClosed)));
        assert!(held_reply.is_consumed());

        // Later exchanges on the same channel are untouched.
        let reply = sender.send(&"fresh".to_string()).await.unwrap();
        assert_eq!(reply, Some("fresh".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_transport() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a.clone(), "skip", StringCodec);
        let _receiver = MessageChannel::new(b, "skip", StringCodec);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = sender
            .send_with_cancellation(&"never".to_string(), &cancel)
            .await;
        assert!(matches!(result, Err(ChannelError::Cancelled)));
        assert_eq!(a.stats().unwrap().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_replacing_handler_keeps_pending_reply_usable() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a, "swap", StringCodec);
        let receiver = MessageChannel::new(b, "swap", StringCodec);

        let (stash_tx, mut stash_rx) = mpsc::unbounded_channel();
        receiver.set_message_handler_fn(move |channel, _message: String, reply| {
            let stash_tx = stash_tx.clone();
            async move {
                let _ = stash_tx.send((channel, reply));
            }
        });

        let sending = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send(&"hold".to_string()).await })
        };
        let (held_channel, held_reply) = stash_rx.recv().await.unwrap();

        // Replace the handler while the first exchange is still open.
        receiver.set_message_handler_fn(|channel, message: String, reply| async move {
            let answer = format!("new {}", message);
            channel.respond(&reply, Some(&answer)).unwrap();
        });

        held_channel
            .respond(&held_reply, Some(&"late".to_string()))
            .unwrap();
        assert_eq!(sending.await.unwrap().unwrap(), Some("late".to_string()));

        let reply = sender.send(&"again".to_string()).await.unwrap();
        assert_eq!(reply, Some("new again".to_string()));
    }

    #[tokio::test]
    async fn test_same_name_last_handler_wins() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a, "shared", StringCodec);
        let first = MessageChannel::new(b.clone(), "shared", StringCodec);
        let second = MessageChannel::new(b.clone(), "shared", StringCodec);

        first.set_message_handler_fn(|channel, _message: String, reply| async move {
            channel.respond(&reply, Some(&"first".to_string())).unwrap();
        });
        second.set_message_handler_fn(|channel, _message: String, reply| async move {
            channel.respond(&reply, Some(&"second".to_string())).unwrap();
        });

        let reply = sender.send(&"who".to_string()).await.unwrap();
        assert_eq!(reply, Some("second".to_string()));
    }

    #[tokio::test]
    async fn test_dropping_channel_deregisters_handler() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a, "gone", StringCodec);
        let receiver = MessageChannel::new(b, "gone", StringCodec);

        receiver.set_message_handler_fn(|channel, message: String, reply| async move {
            channel.respond(&reply, Some(&message)).unwrap();
        });
        assert_eq!(
            sender.send(&"here".to_string()).await.unwrap(),
            Some("here".to_string())
        );

        drop(receiver);
        assert_eq!(sender.send(&"anyone?".to_string()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_handle_fails_local_sender() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a, "void", StringCodec);
        let receiver = MessageChannel::new(b, "void", StringCodec);

        receiver.set_message_handler_fn(|_channel, _message: String, reply| async move {
            drop(reply);
        });

        let result = sender.send(&"hello".to_string()).await;
        assert!(matches!(result, Err(ChannelError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_send_after_peer_closed_fails() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a, "late", StringCodec);

        b.close().await.unwrap();
        drop(b);

        let result = sender.send(&"anyone?".to_string()).await;
        assert!(matches!(result, Err(ChannelError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_messages_dispatched_in_order() {
        let (a, b) = messenger_pair();
        let sender = MessageChannel::new(a, "ordered", StringCodec);
        let receiver = MessageChannel::new(b, "ordered", StringCodec);

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        receiver.set_message_handler_fn(move |channel, message: String, reply| {
            let sink = sink.clone();
            async move {
                sink.lock().push(message);
                channel.respond(&reply, None).unwrap();
            }
        });

        for i in 0..5 {
            sender.send(&format!("m{}", i)).await.unwrap();
        }
        assert_eq!(*log.lock(), vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_channel_over_tcp() {
        use crate::transport::tcp::{TcpConfig, TcpMessenger, TcpMessengerListener};

        let listener =
            TcpMessengerListener::bind("127.0.0.1:0".parse().unwrap(), TcpConfig::default())
                .await
                .unwrap();
        let addr = listener.local_addr().unwrap();
        let client_task =
            tokio::spawn(async move { TcpMessenger::connect(addr, TcpConfig::default()).await });
        let server = Arc::new(listener.accept().await.unwrap());
        let client = Arc::new(client_task.await.unwrap().unwrap());

        let service = MessageChannel::new(server, "math/double", StandardCodec);
        service.set_message_handler_fn(|channel, message: Value, reply| async move {
            let doubled = match message.as_int() {
                Some(n) => Value::from(n * 2),
                None => Value::Null,
            };
            channel.respond(&reply, Some(&doubled)).unwrap();
        });

        let caller = MessageChannel::new(client, "math/double", StandardCodec);
        let reply = caller.send(&Value::from(21)).await.unwrap();
        assert_eq!(reply, Some(Value::from(42)));
    }
}
