use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

use crate::error::{ChannelError, Result};
use crate::value::Value;

/// Trait for translating channel messages to and from wire bytes.
///
/// The message type a channel carries is defined by its codec. Decoding is
/// strict: bytes that do not form exactly one valid message fail with
/// `ChannelError::Decode`. The empty buffer is never passed to a codec; the
/// channel layer treats it as the no-content reply.
pub trait MessageCodec: Send + Sync + std::fmt::Debug {
    /// Message type this codec understands.
    type Value: Send + 'static;

    /// Encode a message into bytes.
    fn encode(&self, message: &Self::Value) -> Result<Vec<u8>>;

    /// Decode bytes into a message.
    fn decode(&self, data: &[u8]) -> Result<Self::Value>;
}

const TAG_NULL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_BYTES: u8 = 6;
const TAG_LIST: u8 = 7;
const TAG_MAP: u8 = 8;

/// Default codec: tagged binary format over [`Value`] trees.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCodec;

impl MessageCodec for StandardCodec {
    type Value = Value;

    fn encode(&self, message: &Value) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, message)?;
        Ok(buf.to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<Value> {
        let mut buf = data;
        let value = decode_value(&mut buf)?;
        if buf.has_remaining() {
            return Err(ChannelError::Decode(format!(
                "{} trailing bytes after value",
                buf.remaining()
            )));
        }
        Ok(value)
    }
}

fn encode_value(buf: &mut BytesMut, value: &Value) -> Result<()> {
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Bool(false) => buf.put_u8(TAG_FALSE),
        Value::Bool(true) => buf.put_u8(TAG_TRUE),
        Value::Int(v) => {
            buf.put_u8(TAG_INT);
            buf.put_i64_le(*v);
        }
        Value::Float(v) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_f64_le(*v);
        }
        Value::String(s) => {
            buf.put_u8(TAG_STRING);
            encode_len(buf, s.len())?;
            buf.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            encode_len(buf, b.len())?;
            buf.put_slice(b);
        }
        Value::List(items) => {
            buf.put_u8(TAG_LIST);
            encode_len(buf, items.len())?;
            for item in items {
                encode_value(buf, item)?;
            }
        }
        Value::Map(entries) => {
            buf.put_u8(TAG_MAP);
            encode_len(buf, entries.len())?;
            for (key, value) in entries {
                encode_value(buf, key)?;
                encode_value(buf, value)?;
            }
        }
    }
    Ok(())
}

fn encode_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    if len > u32::MAX as usize {
        return Err(ChannelError::Encode(format!(
            "Length {} exceeds encodable range",
            len
        )));
    }
    buf.put_u32_le(len as u32);
    Ok(())
}

fn decode_value<B: Buf>(buf: &mut B) -> Result<Value> {
    if buf.remaining() < 1 {
        return Err(ChannelError::Decode("Truncated value: missing tag".to_string()));
    }

    match buf.get_u8() {
        TAG_NULL => Ok(Value::Null),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_INT => {
            if buf.remaining() < 8 {
                return Err(ChannelError::Decode("Truncated integer".to_string()));
            }
            Ok(Value::Int(buf.get_i64_le()))
        }
        TAG_FLOAT => {
            if buf.remaining() < 8 {
                return Err(ChannelError::Decode("Truncated float".to_string()));
            }
            Ok(Value::Float(buf.get_f64_le()))
        }
        TAG_STRING => {
            let len = decode_len(buf)?;
            let mut bytes = vec![0u8; len];
            buf.copy_to_slice(&mut bytes);
            String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|e| ChannelError::Decode(format!("Invalid string: {}", e)))
        }
        TAG_BYTES => {
            let len = decode_len(buf)?;
            let mut bytes = vec![0u8; len];
            buf.copy_to_slice(&mut bytes);
            Ok(Value::Bytes(bytes))
        }
        TAG_LIST => {
            let count = decode_count(buf)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(buf)?);
            }
            Ok(Value::List(items))
        }
        TAG_MAP => {
            let count = decode_count(buf)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = decode_value(buf)?;
                let value = decode_value(buf)?;
                entries.push((key, value));
            }
            Ok(Value::Map(entries))
        }
        tag => Err(ChannelError::Decode(format!("Unknown value tag: {}", tag))),
    }
}

fn decode_len<B: Buf>(buf: &mut B) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(ChannelError::Decode("Truncated length field".to_string()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(ChannelError::Decode("Incomplete value".to_string()));
    }
    Ok(len)
}

fn decode_count<B: Buf>(buf: &mut B) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(ChannelError::Decode("Truncated count field".to_string()));
    }
    let count = buf.get_u32_le() as usize;
    // Every element takes at least one tag byte.
    if buf.remaining() < count {
        return Err(ChannelError::Decode("Incomplete collection".to_string()));
    }
    Ok(count)
}

/// JSON codec over `serde_json::Value` trees.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    type Value = serde_json::Value;

    fn encode(&self, message: &serde_json::Value) -> Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| ChannelError::Encode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(data).map_err(|e| ChannelError::Decode(e.to_string()))
    }
}

/// Lossless UTF-8 string codec.
///
/// The empty string encodes to an empty buffer, which the reply position
/// reports as no content.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl MessageCodec for StringCodec {
    type Value = String;

    fn encode(&self, message: &String) -> Result<Vec<u8>> {
        Ok(message.as_bytes().to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<String> {
        String::from_utf8(data.to_vec())
            .map_err(|e| ChannelError::Decode(format!("Invalid UTF-8: {}", e)))
    }
}

/// Passthrough codec for raw byte buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl MessageCodec for BinaryCodec {
    type Value = Bytes;

    fn encode(&self, message: &Bytes) -> Result<Vec<u8>> {
        Ok(message.to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Generic serde codec for user-defined message types.
pub struct BincodeCodec<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Copy for BincodeCodec<T> {}

impl<T> std::fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BincodeCodec")
    }
}

impl<T> MessageCodec for BincodeCodec<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Send + 'static,
{
    type Value = T;

    fn encode(&self, message: &T) -> Result<Vec<u8>> {
        bincode::serialize(message).map_err(|e| ChannelError::Encode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<T> {
        bincode::deserialize(data).map_err(|e| ChannelError::Decode(e.to_string()))
    }
}
