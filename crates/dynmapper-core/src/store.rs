//! Mapping persistence contract.

use async_trait::async_trait;

use crate::model::Mapping;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Storage backend failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Stored row could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No mapping with this id.
    #[error("Mapping not found: {0}")]
    NotFound(String),

    /// Other error.
    #[error("Store error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Identity-by-id storage of full mapping objects, per tenant.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn list(&self, tenant: &str) -> Result<Vec<Mapping>>;

    async fn get(&self, tenant: &str, id: &str) -> Result<Option<Mapping>>;

    /// Store a new mapping. The mapping id must already be assigned.
    async fn create(&self, tenant: &str, mapping: &Mapping) -> Result<()>;

    /// Replace a stored mapping, failing with [`StoreError::NotFound`] if absent.
    async fn update(&self, tenant: &str, mapping: &Mapping) -> Result<()>;

    /// Delete a mapping, returning whether it existed.
    async fn delete(&self, tenant: &str, id: &str) -> Result<bool>;
}
