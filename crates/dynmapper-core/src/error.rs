//! Error types shared by the mapper crates.

use crate::platform::PlatformError;
use crate::store::StoreError;
use crate::validation::ValidationError;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A mapping could not be placed in or removed from the resolver tree.
    #[error("Resolve error: {0}")]
    Resolve(String),

    /// A topic or topic pattern is malformed.
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// Mapping failed validation.
    #[error("Validation errors: {}", format_violations(.0))]
    Validation(Vec<ValidationError>),

    /// The mapping is active and the operation requires it to be deactivated.
    #[error("Mapping {0} is still active, deactivate mapping before changing it")]
    MappingActive(String),

    /// Mapping or other resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Tenant has no registry state.
    #[error("Tenant {0} is not initialized")]
    TenantNotInitialized(String),

    /// Persistence failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration failure.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Platform collaborator failure.
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

fn format_violations(violations: &[ValidationError]) -> String {
    violations
        .iter()
        .map(|v| format!("[ {} ]", v))
        .collect::<Vec<_>>()
        .join("")
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
