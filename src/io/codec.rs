use bytes::Bytes;
use thiserror::Error;

/// A payload the codec could not decode.
#[derive(Debug, Error)]
#[error("codec error: {0}")]
pub struct CodecError(pub String);

/// Transforms frame payloads on their way to and from a block file.
pub trait BlockCodec: Send + Sync {
    /// Stable identifier persisted in generation headers.
    fn id(&self) -> u8;

    /// Transform a raw frame payload for storage.
    fn encode(&self, raw: &[u8]) -> Bytes;

    /// Inverse of `encode`.
    fn decode(&self, stored: &[u8]) -> Result<Bytes, CodecError>;
}

/// Identity codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct Uncompressed;

impl BlockCodec for Uncompressed {
    fn id(&self) -> u8 {
        0
    }

    fn encode(&self, raw: &[u8]) -> Bytes {
        Bytes::copy_from_slice(raw)
    }

    fn decode(&self, stored: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(stored))
    }
}
