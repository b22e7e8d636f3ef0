use parking_lot::Mutex;

use crate::transport::ReplySender;

/// Single-use handle for answering one inbound message.
///
/// The channel hands one of these to its handler per message. Responding
/// consumes the reply route; any further respond call on the same handle
/// fails with `InvalidHandle` and performs no transport activity. The
/// handle can be moved to another task and answered later.
pub struct ResponseHandle {
    channel: String,
    reply: Mutex<Option<ReplySender>>,
}

impl ResponseHandle {
    pub(crate) fn new(reply: ReplySender) -> Self {
        Self {
            channel: reply.channel().to_string(),
            reply: Mutex::new(Some(reply)),
        }
    }

    /// Name of the channel the message arrived on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether this handle has already been used to respond.
    pub fn is_consumed(&self) -> bool {
        self.reply.lock().is_none()
    }

    /// Take the reply route out of the handle. Returns `None` if it was
    /// already taken.
    pub(crate) fn take(&self) -> Option<ReplySender> {
        self.reply.lock().take()
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.get_mut().take() {
            tracing::warn!(channel = %self.channel, "response handle dropped without a reply");
            drop(reply);
        }
    }
}

impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("channel", &self.channel)
            .field("consumed", &self.is_consumed())
            .finish()
    }
}
