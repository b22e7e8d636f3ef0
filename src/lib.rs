//! msgchan - Named bidirectional message channels over byte transports
pub mod channel;
pub mod codec;
pub mod error;
pub mod transport;
pub mod value;

pub use channel::{FnMessageHandler, MessageChannel, MessageHandler, ResponseHandle};
pub use codec::{BinaryCodec, BincodeCodec, JsonCodec, MessageCodec, StandardCodec, StringCodec};
pub use error::{ChannelError, Result, TransportError, TransportResult};
pub use transport::local::{LocalConfig, LocalMessenger};
pub use transport::tcp::{TcpConfig, TcpMessenger, TcpMessengerListener};
pub use transport::{BinaryHandler, Messenger, ReplySender, TransportStats};
pub use value::Value;

// Sends take an external cancellation token; re-exported for callers.
pub use tokio_util::sync::CancellationToken;
