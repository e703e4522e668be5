//! Typed event payload codec.

use std::marker::PhantomData;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use skiff_store_core::MAX_PAYLOAD_BYTES;

/// Errors raised while encoding or decoding typed event payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Encoded event exceeds the raw-event payload bound.
    #[error("encoded event is {0} bytes, exceeding the {MAX_PAYLOAD_BYTES}-byte payload limit")]
    TooLarge(usize),
    /// The payload framing is damaged.
    #[error("malformed event payload: {0}")]
    Malformed(String),
    /// Serialization failure.
    #[error(transparent)]
    Encode(#[from] rmp_serde::encode::Error),
    /// Deserialization failure.
    #[error(transparent)]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encodes events into raw-event payloads and back.
///
/// Payloads must be positive multiples of eight bytes; implementations own
/// whatever framing makes that true. Polymorphic events should carry a
/// stable discriminator inside the serialized body - with serde that is a
/// tagged enum, registered here at the codec boundary rather than through
/// source-level hierarchies.
pub trait EventCodec<E>: Send + Sync + 'static {
    /// Serialize `event` into a payload acceptable to
    /// [`RawEvent::new`](skiff_store_core::RawEvent::new).
    fn encode(&self, event: &E) -> Result<Bytes, CodecError>;

    /// Deserialize an event from a payload previously produced by `encode`.
    fn decode(&self, payload: &[u8]) -> Result<E, CodecError>;
}

/// MessagePack codec: a little-endian `u32` body length, the
/// `rmp-serde`-encoded body (field names preserved, so enum variant tags are
/// stable on the wire), and zero padding up to the next multiple of eight.
pub struct MsgPackCodec<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E> Default for MsgPackCodec<E> {
    fn default() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<E> MsgPackCodec<E> {
    /// Create the codec.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E> EventCodec<E> for MsgPackCodec<E>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, event: &E) -> Result<Bytes, CodecError> {
        let body = rmp_serde::to_vec_named(event)?;
        let framed = 4 + body.len();
        let padded = framed.div_ceil(8) * 8;
        if padded > MAX_PAYLOAD_BYTES {
            return Err(CodecError::TooLarge(padded));
        }
        let mut buf = BytesMut::with_capacity(padded);
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
        buf.put_bytes(0, padded - framed);
        Ok(buf.freeze())
    }

    fn decode(&self, payload: &[u8]) -> Result<E, CodecError> {
        if payload.len() < 4 {
            return Err(CodecError::Malformed("payload shorter than its length prefix".into()));
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&payload[..4]);
        let body_len = u32::from_le_bytes(raw) as usize;
        let Some(body) = payload.get(4..4 + body_len) else {
            return Err(CodecError::Malformed(format!(
                "length prefix {body_len} overruns a {}-byte payload",
                payload.len()
            )));
        };
        Ok(rmp_serde::from_slice(body)?)
    }
}
