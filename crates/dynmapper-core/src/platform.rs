//! Device management platform contract.
//!
//! The engine only talks to the platform through [`PlatformClient`]. Every
//! call is remote and may fail with a [`PlatformError`]; calls are made from
//! fan-out units, never from the resolver read path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Api;

/// Result type for platform operations.
pub type Result<T> = std::result::Result<T, PlatformError>;

/// Typed platform failures.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The platform could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// The referenced object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The platform rejected the request.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Other error.
    #[error("Platform error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Request to create a device, or update it if the external id is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpsert {
    pub name: String,
    pub device_type: String,
    pub external_id: String,
    pub external_id_type: String,
    /// Additional fragments stored on the device.
    #[serde(default)]
    pub fragments: Value,
}

impl DeviceUpsert {
    /// Device created on the fly for an unknown external id.
    pub fn auto_created(external_id_type: &str, external_id: &str) -> Self {
        Self {
            name: format!("device_{}_{}", external_id_type, external_id),
            device_type: "c8y_GeneratedDevice".to_string(),
            external_id: external_id.to_string(),
            external_id_type: external_id_type.to_string(),
            fragments: Value::Object(serde_json::Map::new()),
        }
    }
}

/// A device as stored on the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedObject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub fragments: Value,
}

/// Platform object store used by the engine.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Resolve an external identifier to the platform internal id.
    async fn resolve_external_id(
        &self,
        tenant: &str,
        external_id_type: &str,
        external_id: &str,
    ) -> Result<Option<String>>;

    /// Reverse lookup of the external identifier of a device.
    async fn find_external_id(
        &self,
        tenant: &str,
        internal_id: &str,
        external_id_type: &str,
    ) -> Result<Option<String>>;

    /// Create a device, or update the device registered for its external id.
    async fn create_or_update_device(&self, tenant: &str, device: &DeviceUpsert) -> Result<ManagedObject>;

    /// Create an event, alarm, measurement or operation.
    async fn create_object(&self, tenant: &str, api: Api, payload: &Value) -> Result<Value>;

    /// Update the inventory object `internal_id` with `payload`.
    async fn update_inventory(&self, tenant: &str, internal_id: &str, payload: &Value) -> Result<Value>;
}
