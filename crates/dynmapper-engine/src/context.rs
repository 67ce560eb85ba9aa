//! Per message processing state.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use dynmapper_core::{Api, Mapping, SubstituteValue};

use crate::error::ProcessingError;

/// Extracted values by (resolved) target path.
pub type ProcessingCache = BTreeMap<String, Vec<SubstituteValue>>;

/// Kind of platform request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestMethod {
    /// Create an object.
    Post,
    /// Create or update a device.
    Put,
    /// Publish to the transport.
    Publish,
}

/// A request issued (or prepared, when not sending) for one device.
#[derive(Debug, Clone)]
pub struct PlatformRequest {
    /// Index of the request this one depends on, within the same context.
    pub predecessor: Option<usize>,
    pub device_index: usize,
    pub method: RequestMethod,
    pub api: Api,
    /// Platform internal id of the device.
    pub source: Option<String>,
    pub external_id_type: String,
    pub payload: Value,
    /// Transport topic of an outbound request.
    pub topic: Option<String>,
    pub response: Option<Value>,
    pub error: Option<ProcessingError>,
}

impl PlatformRequest {
    pub fn new(device_index: usize, method: RequestMethod, api: Api, payload: Value) -> Self {
        Self {
            predecessor: None,
            device_index,
            method,
            api,
            source: None,
            external_id_type: String::new(),
            payload,
            topic: None,
            response: None,
            error: None,
        }
    }

    pub fn with_predecessor(mut self, predecessor: Option<usize>) -> Self {
        self.predecessor = predecessor;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_external_id_type(mut self, external_id_type: impl Into<String>) -> Self {
        self.external_id_type = external_id_type.into();
        self
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Result of one device unit. Predecessor indices are local to `requests`.
#[derive(Debug, Clone)]
pub struct DeviceOutcome {
    pub device_index: usize,
    pub requests: Vec<PlatformRequest>,
    pub error: Option<ProcessingError>,
}

impl DeviceOutcome {
    pub fn succeeded(device_index: usize, requests: Vec<PlatformRequest>) -> Self {
        Self {
            device_index,
            requests,
            error: None,
        }
    }

    pub fn failed(device_index: usize, requests: Vec<PlatformRequest>, error: ProcessingError) -> Self {
        Self {
            device_index,
            requests,
            error: Some(error),
        }
    }
}

/// State of one (message, mapping) pair, threaded through extraction,
/// substitution and dispatch.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub tenant: String,
    pub topic: String,
    pub key: Option<String>,
    pub mapping: Arc<Mapping>,
    /// Deserialized and enriched payload.
    pub payload: Value,
    pub processing_cache: ProcessingCache,
    /// Values of the identifier path, one per device.
    pub device_entries: Vec<SubstituteValue>,
    pub requests: Vec<PlatformRequest>,
    /// Every error of this context, in the order raised.
    pub errors: Vec<ProcessingError>,
    /// Errors of failed device units by device index.
    pub device_errors: BTreeMap<usize, ProcessingError>,
    pub send_payload: bool,
    pub ignore_further_processing: bool,
}

impl ProcessingContext {
    pub fn new(tenant: &str, topic: &str, mapping: Arc<Mapping>, payload: Value, send_payload: bool) -> Self {
        Self {
            tenant: tenant.to_string(),
            topic: topic.to_string(),
            key: None,
            mapping,
            payload,
            processing_cache: ProcessingCache::new(),
            device_entries: Vec::new(),
            requests: Vec::new(),
            errors: Vec::new(),
            device_errors: BTreeMap::new(),
            send_payload,
            ignore_further_processing: false,
        }
    }

    pub fn add_error(&mut self, error: ProcessingError) {
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Append a device unit's requests and error, shifting its local
    /// predecessor indices into this context.
    pub fn merge_outcome(&mut self, outcome: DeviceOutcome) {
        let offset = self.requests.len();
        for mut request in outcome.requests {
            request.predecessor = request.predecessor.map(|p| p + offset);
            self.requests.push(request);
        }
        if let Some(error) = outcome.error {
            self.device_errors.insert(outcome.device_index, error.clone());
            self.errors.push(error);
        }
    }

    /// Indices of the devices whose unit failed, ascending.
    pub fn failed_devices(&self) -> Vec<usize> {
        self.device_errors.keys().copied().collect()
    }

    /// Requests issued for one device, in chain order.
    pub fn requests_for_device(&self, device_index: usize) -> Vec<&PlatformRequest> {
        self.requests
            .iter()
            .filter(|r| r.device_index == device_index)
            .collect()
    }

    /// Number of devices the message fanned out to.
    pub fn fan_out(&self) -> usize {
        self.device_entries.len()
    }
}
