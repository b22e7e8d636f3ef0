use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Message not encodable: {0}")]
    Encode(String),

    #[error("Malformed message: {0}")]
    Decode(String),

    #[error("Response handle already consumed")]
    InvalidHandle,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Connection failed to {name}: {reason}")]
    ConnectionFailed { name: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl From<TransportError> for ChannelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected | TransportError::ConnectionClosed => {
                ChannelError::ConnectionClosed
            }
            other => ChannelError::Transport(other),
        }
    }
}
