//! Row payload encoding
//!
//! Partitions store rows as opaque bytes. The coordinator encodes a field
//! vector before staging it and decodes committed payloads when it needs the
//! indexed field values back.

use crate::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode row: {0}")]
    Encode(String),

    #[error("Failed to decode row: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Turns a row's field vector into a payload and back
pub trait RowCodec: Send + Sync {
    fn encode(&self, fields: &[Value]) -> Result<Vec<u8>>;

    fn decode(&self, payload: &[u8]) -> Result<Vec<Value>>;
}

/// CBOR row encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl RowCodec for CborCodec {
    fn encode(&self, fields: &[Value]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(fields, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(buf)
    }

    fn decode(&self, payload: &[u8]) -> Result<Vec<Value>> {
        ciborium::from_reader(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
