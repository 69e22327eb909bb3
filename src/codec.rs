//! Payload codec boundary.
//!
//! The codec moves between raw body bytes and a self-describing structured
//! value; typed (de)serialization happens in the subscribe-time closures, so
//! the codec itself stays event-shape-agnostic.

use serde_json::Value;

use crate::error::CodecError;

pub trait PayloadCodec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// UTF-8 JSON text codec, the default wire encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
