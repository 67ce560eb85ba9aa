//! Transport connector contract.

use async_trait::async_trait;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport error types.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connector is not connected.
    #[error("Connector not connected")]
    NotConnected,

    /// Publish failed.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Other error.
    #[error("Transport error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A message delivered by the transport connector.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub tenant: String,
    pub topic: String,
    pub payload: Vec<u8>,
    /// Message key, for transports that carry one.
    pub key: Option<String>,
}

impl TransportMessage {
    pub fn new(tenant: impl Into<String>, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tenant: tenant.into(),
            topic: topic.into(),
            payload: payload.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Outbound side of a transport connector.
#[async_trait]
pub trait TransportPublisher: Send + Sync {
    async fn publish(&self, tenant: &str, topic: &str, payload: Vec<u8>, qos: u8) -> Result<()>;
}
