//! In-memory collaborators for tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use dynmapper_core::platform::{self, DeviceUpsert, ManagedObject, PlatformClient, PlatformError};
use dynmapper_core::transport::{self, TransportError, TransportPublisher};
use dynmapper_core::Api;

/// A call received by [`MockPlatform`].
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformCall {
    ResolveExternalId { external_id_type: String, external_id: String },
    FindExternalId { internal_id: String, external_id_type: String },
    CreateOrUpdateDevice(DeviceUpsert),
    CreateObject { api: Api, payload: Value },
    UpdateInventory { internal_id: String, payload: Value },
}

/// Tracks in-flight calls and the peak concurrency seen.
#[derive(Debug, Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Platform double with an identity registry and call log.
#[derive(Debug, Default)]
pub struct MockPlatform {
    identities: Mutex<HashMap<(String, String), String>>,
    devices: Mutex<HashMap<String, ManagedObject>>,
    calls: Mutex<Vec<PlatformCall>>,
    creation_order: Mutex<Vec<String>>,
    slow_sources: Mutex<HashSet<String>>,
    creation_delay: Mutex<Duration>,
    object_delay: Mutex<Duration>,
    slow_delay: Mutex<Duration>,
    fail_objects: AtomicBool,
    fail_creations: AtomicBool,
    creations: Gauge,
    objects: Gauge,
    next_id: AtomicUsize,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing device under an external id.
    pub fn register_device(&self, external_id_type: &str, external_id: &str, internal_id: &str) {
        self.identities.lock().insert(
            (external_id_type.to_string(), external_id.to_string()),
            internal_id.to_string(),
        );
        self.devices.lock().insert(
            internal_id.to_string(),
            ManagedObject {
                id: internal_id.to_string(),
                name: format!("device_{}", external_id),
                fragments: json!({}),
            },
        );
    }

    pub fn with_creation_delay(self, delay: Duration) -> Self {
        *self.creation_delay.lock() = delay;
        self
    }

    pub fn with_object_delay(self, delay: Duration) -> Self {
        *self.object_delay.lock() = delay;
        self
    }

    /// Objects whose `source.id` is `source` take `delay` to create.
    pub fn with_slow_source(self, source: &str, delay: Duration) -> Self {
        self.slow_sources.lock().insert(source.to_string());
        *self.slow_delay.lock() = delay;
        self
    }

    pub fn fail_objects(&self, fail: bool) {
        self.fail_objects.store(fail, Ordering::SeqCst);
    }

    pub fn fail_creations(&self, fail: bool) {
        self.fail_creations.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().clone()
    }

    /// Payloads passed to `create_object`, in call order.
    pub fn created_objects(&self) -> Vec<(Api, Value)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                PlatformCall::CreateObject { api, payload } => Some((*api, payload.clone())),
                _ => None,
            })
            .collect()
    }

    /// External ids of created devices, in creation order.
    pub fn creation_order(&self) -> Vec<String> {
        self.creation_order.lock().clone()
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn max_concurrent_creations(&self) -> usize {
        self.creations.peak.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_objects(&self) -> usize {
        self.objects.peak.load(Ordering::SeqCst)
    }

    fn record(&self, call: PlatformCall) {
        self.calls.lock().push(call);
    }

    fn allocate_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::SeqCst) + 1000).to_string()
    }

    async fn pause(delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PlatformClient for MockPlatform {
    async fn resolve_external_id(
        &self,
        _tenant: &str,
        external_id_type: &str,
        external_id: &str,
    ) -> platform::Result<Option<String>> {
        self.record(PlatformCall::ResolveExternalId {
            external_id_type: external_id_type.to_string(),
            external_id: external_id.to_string(),
        });
        let key = (external_id_type.to_string(), external_id.to_string());
        Ok(self.identities.lock().get(&key).cloned())
    }

    async fn find_external_id(
        &self,
        _tenant: &str,
        internal_id: &str,
        external_id_type: &str,
    ) -> platform::Result<Option<String>> {
        self.record(PlatformCall::FindExternalId {
            internal_id: internal_id.to_string(),
            external_id_type: external_id_type.to_string(),
        });
        Ok(self
            .identities
            .lock()
            .iter()
            .find(|((t, _), id)| t == external_id_type && id.as_str() == internal_id)
            .map(|((_, ext), _)| ext.clone()))
    }

    async fn create_or_update_device(
        &self,
        _tenant: &str,
        device: &DeviceUpsert,
    ) -> platform::Result<ManagedObject> {
        self.record(PlatformCall::CreateOrUpdateDevice(device.clone()));
        self.creations.enter();
        let delay = *self.creation_delay.lock();
        Self::pause(delay).await;
        self.creations.leave();

        if self.fail_creations.load(Ordering::SeqCst) {
            return Err(PlatformError::Other(anyhow::anyhow!("device creation refused")));
        }

        let key = (device.external_id_type.clone(), device.external_id.clone());
        let existing = self.identities.lock().get(&key).cloned();
        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.allocate_id();
                self.identities.lock().insert(key, id.clone());
                self.creation_order.lock().push(device.external_id.clone());
                id
            }
        };
        let object = ManagedObject {
            id: id.clone(),
            name: device.name.clone(),
            fragments: device.fragments.clone(),
        };
        self.devices.lock().insert(id, object.clone());
        Ok(object)
    }

    async fn create_object(&self, _tenant: &str, api: Api, payload: &Value) -> platform::Result<Value> {
        self.record(PlatformCall::CreateObject {
            api,
            payload: payload.clone(),
        });
        self.objects.enter();
        let source = payload
            .pointer("/source/id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let slow = source.map_or(false, |s| self.slow_sources.lock().contains(&s));
        let delay = if slow {
            *self.slow_delay.lock()
        } else {
            *self.object_delay.lock()
        };
        Self::pause(delay).await;
        self.objects.leave();

        if self.fail_objects.load(Ordering::SeqCst) {
            return Err(PlatformError::Validation("object rejected".to_string()));
        }
        let mut created = payload.clone();
        if let Value::Object(map) = &mut created {
            map.insert("id".to_string(), Value::String(self.allocate_id()));
        }
        Ok(created)
    }

    async fn update_inventory(&self, _tenant: &str, internal_id: &str, payload: &Value) -> platform::Result<Value> {
        self.record(PlatformCall::UpdateInventory {
            internal_id: internal_id.to_string(),
            payload: payload.clone(),
        });
        if !self.devices.lock().contains_key(internal_id) {
            return Err(PlatformError::NotFound(format!("managed object {}", internal_id)));
        }
        Ok(payload.clone())
    }
}

/// Publisher double that records every publish.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    disconnected: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// `(topic, payload)` of every publish, in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl TransportPublisher for RecordingPublisher {
    async fn publish(&self, _tenant: &str, topic: &str, payload: Vec<u8>, _qos: u8) -> transport::Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }
}
