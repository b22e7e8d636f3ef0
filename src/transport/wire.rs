use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{TransportError, TransportResult};

/// Magic bytes identifying a channel frame ("MCHN")
pub(crate) const MAGIC: [u8; 4] = [0x4D, 0x43, 0x48, 0x4E];

/// Protocol version
pub(crate) const VERSION: u8 = 1;

/// Fixed frame header size: magic + version + kind + id + name length
pub(crate) const HEADER_SIZE: usize = 4 + 1 + 1 + 8 + 2;

/// Direction of a frame within one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// Named message expecting a reply
    Message = 0,
    /// Reply settling a previously sent message
    Reply = 1,
}

impl FrameKind {
    fn from_u8(value: u8) -> TransportResult<Self> {
        match value {
            0 => Ok(FrameKind::Message),
            1 => Ok(FrameKind::Reply),
            other => Err(TransportError::Protocol(format!(
                "Unknown frame kind: {}",
                other
            ))),
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }
}

/// One frame on the wire.
///
/// Message frames carry the channel name; reply frames carry only the id
/// of the exchange they settle, with an empty name. The payload runs to
/// the end of the frame, so an empty payload is representable and means
/// no content.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Frame {
    pub kind: FrameKind,
    pub id: u64,
    pub channel: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn message(id: u64, channel: impl Into<String>, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Message,
            id,
            channel: channel.into(),
            payload,
        }
    }

    pub fn reply(id: u64, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Reply,
            id,
            channel: String::new(),
            payload,
        }
    }

    /// Serialize the frame. The outer length prefix is added by the writer.
    pub fn encode(&self) -> TransportResult<BytesMut> {
        if self.channel.len() > u16::MAX as usize {
            return Err(TransportError::Protocol(format!(
                "Channel name too long: {} bytes",
                self.channel.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.channel.len() + self.payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.kind.to_u8());
        buf.put_u64_le(self.id);
        buf.put_u16_le(self.channel.len() as u16);
        buf.put_slice(self.channel.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Parse one frame from a complete frame buffer.
    pub fn decode(mut buf: impl Buf) -> TransportResult<Self> {
        if buf.remaining() < HEADER_SIZE {
            return Err(TransportError::Protocol(
                "Buffer too small for frame header".to_string(),
            ));
        }

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(TransportError::Protocol(format!(
                "Invalid magic bytes: {:?}",
                magic
            )));
        }

        let version = buf.get_u8();
        if version != VERSION {
            return Err(TransportError::Protocol(format!(
                "Unsupported protocol version: {}",
                version
            )));
        }

        let kind = FrameKind::from_u8(buf.get_u8())?;
        let id = buf.get_u64_le();
        let name_len = buf.get_u16_le() as usize;

        if buf.remaining() < name_len {
            return Err(TransportError::Protocol("Incomplete frame".to_string()));
        }
        let mut name = vec![0u8; name_len];
        buf.copy_to_slice(&mut name);
        let channel = String::from_utf8(name)
            .map_err(|e| TransportError::Protocol(format!("Invalid channel name: {}", e)))?;

        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Self {
            kind,
            id,
            channel,
            payload,
        })
    }
}
