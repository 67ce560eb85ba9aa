//! Processing errors.
//!
//! Errors local to one substitution or one device unit are collected on the
//! [`ProcessingContext`](crate::ProcessingContext); only a failure to resolve
//! mappings at all is returned as `Err` for the whole message.

use dynmapper_core::{PlatformError, TransportError};

/// Per message processing errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProcessingError {
    /// Mappings could not be resolved for the message.
    #[error("Cannot resolve mappings: {0}")]
    Resolution(String),

    /// The payload could not be deserialized for a mapping.
    #[error("Cannot deserialize payload for mapping {mapping}: {reason}")]
    Deserialization { mapping: String, reason: String },

    /// A source path could not be evaluated; the substitution is skipped.
    #[error("Cannot evaluate '{path}': {reason}")]
    Extraction { path: String, reason: String },

    /// Not enough values for a device and no repair strategy closes the gap.
    #[error("Device {device_index}: '{path}' has {available} values for {required} devices")]
    Arity {
        path: String,
        available: usize,
        required: usize,
        device_index: usize,
    },

    /// External identifier unknown and device creation disabled.
    #[error("External id {external_id} of type {external_id_type} not found")]
    IdentifierNotFound {
        external_id_type: String,
        external_id: String,
    },

    /// The identifier substitution produced no value.
    #[error("No value for identifier path '{0}'")]
    MissingIdentifier(String),

    /// A target could not be serialized for the transport.
    #[error("Cannot serialize payload for mapping {mapping}: {reason}")]
    Serialization { mapping: String, reason: String },

    /// A value could not be written into the target.
    #[error("Cannot substitute '{path}': {reason}")]
    Substitution { path: String, reason: String },

    /// The platform rejected or failed a call.
    #[error("Platform call failed: {0}")]
    Platform(String),

    /// The transport could not publish an outbound payload.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// A device unit did not finish within the dispatch timeout.
    #[error("Device {device_index} timed out after {timeout_ms}ms")]
    Timeout { device_index: usize, timeout_ms: u64 },

    /// A device unit panicked or was cancelled.
    #[error("Device {device_index} task failed: {reason}")]
    TaskFailed { device_index: usize, reason: String },

    /// The mapping filter could not be evaluated.
    #[error("Cannot evaluate filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },
}

impl ProcessingError {
    /// Device index the error is attached to, if it is device local.
    pub fn device_index(&self) -> Option<usize> {
        match self {
            ProcessingError::Arity { device_index, .. }
            | ProcessingError::Timeout { device_index, .. }
            | ProcessingError::TaskFailed { device_index, .. } => Some(*device_index),
            _ => None,
        }
    }
}

impl From<PlatformError> for ProcessingError {
    fn from(e: PlatformError) -> Self {
        ProcessingError::Platform(e.to_string())
    }
}

impl From<TransportError> for ProcessingError {
    fn from(e: TransportError) -> Self {
        ProcessingError::Publish(e.to_string())
    }
}
