//! Payload codecs, selected by the mapping type.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use dynmapper_core::MappingType;

/// Field carrying the payload of flat file and binary messages.
pub const MESSAGE_FIELD: &str = "message";

/// Codec error types.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Payload does not match the codec format.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// No codec registered for the mapping type.
    #[error("No codec registered for mapping type {0:?}")]
    Unsupported(MappingType),
}

/// Converts raw transport payloads to structured values and back.
pub trait PayloadCodec: Send + Sync {
    fn deserialize(&self, payload: &[u8]) -> Result<Value, CodecError>;

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
}

/// JSON documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn deserialize(&self, payload: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(payload).map_err(|e| CodecError::InvalidPayload(e.to_string()))
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::InvalidPayload(e.to_string()))
    }
}

/// Plain text lines, exposed as `{"message": "<text>"}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatFileCodec;

impl PayloadCodec for FlatFileCodec {
    fn deserialize(&self, payload: &[u8]) -> Result<Value, CodecError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| CodecError::InvalidPayload(format!("not UTF-8: {}", e)))?;
        Ok(json!({ MESSAGE_FIELD: text }))
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        match value.get(MESSAGE_FIELD) {
            Some(Value::String(text)) => Ok(text.as_bytes().to_vec()),
            _ => serde_json::to_vec(value).map_err(|e| CodecError::InvalidPayload(e.to_string())),
        }
    }
}

/// Opaque bytes, exposed as `{"message": "0x<hex>"}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCodec;

impl PayloadCodec for BinaryCodec {
    fn deserialize(&self, payload: &[u8]) -> Result<Value, CodecError> {
        Ok(json!({ MESSAGE_FIELD: format!("0x{}", hex::encode(payload)) }))
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let text = value
            .get(MESSAGE_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| CodecError::InvalidPayload(format!("missing '{}' field", MESSAGE_FIELD)))?;
        let hex_str = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        hex::decode(hex_str).map_err(|e| CodecError::InvalidPayload(format!("invalid hex: {}", e)))
    }
}

/// Codecs by mapping type.
///
/// JSON, flat file and generic binary are built in; protobuf and processor
/// extension codecs are registered by the embedding service.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<MappingType, Arc<dyn PayloadCodec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(MappingType::Json, Arc::new(JsonCodec));
        registry.register(MappingType::FlatFile, Arc::new(FlatFileCodec));
        registry.register(MappingType::GenericBinary, Arc::new(BinaryCodec));
        registry
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    pub fn register(&mut self, mapping_type: MappingType, codec: Arc<dyn PayloadCodec>) {
        self.codecs.insert(mapping_type, codec);
    }

    pub fn get(&self, mapping_type: MappingType) -> Result<Arc<dyn PayloadCodec>, CodecError> {
        self.codecs
            .get(&mapping_type)
            .cloned()
            .ok_or(CodecError::Unsupported(mapping_type))
    }
}
