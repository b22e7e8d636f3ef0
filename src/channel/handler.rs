use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::channel::{MessageChannel, ResponseHandle};
use crate::codec::MessageCodec;
use crate::transport::Messenger;

/// Handler for decoded inbound messages on a channel.
///
/// One invocation per message, in arrival order. The channel the message
/// arrived on is passed in so handlers can send back without capturing it.
/// The reply handle is answered through [`MessageChannel::respond`], now or
/// from another task.
#[async_trait]
pub trait MessageHandler<M: Messenger, C: MessageCodec>: Send + Sync {
    async fn on_message(
        &self,
        channel: MessageChannel<M, C>,
        message: C::Value,
        reply: ResponseHandle,
    );
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnMessageHandler<F> {
    func: Arc<F>,
}

impl<F> FnMessageHandler<F> {
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl<M, C, F, Fut> MessageHandler<M, C> for FnMessageHandler<F>
where
    M: Messenger + 'static,
    C: MessageCodec + 'static,
    F: Fn(MessageChannel<M, C>, C::Value, ResponseHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_message(
        &self,
        channel: MessageChannel<M, C>,
        message: C::Value,
        reply: ResponseHandle,
    ) {
        (self.func)(channel, message, reply).await
    }
}
