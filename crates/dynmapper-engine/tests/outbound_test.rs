//! Outbound processing tests.
//!
//! Tests include:
//! - Filter and API based resolution
//! - Identity enrichment and topic level splicing
//! - Dry runs and publish failures

use std::sync::Arc;

use serde_json::{json, Value};

use dynmapper_core::{Api, Mapping, ServiceConfiguration, Substitution};
use dynmapper_engine::{
    MappingRegistry, MockPlatform, OutboundProcessor, ProcessingError, RecordingPublisher, RequestMethod,
};
use dynmapper_storage::MemoryMappingStore;

const TENANT: &str = "t200";

struct Harness {
    registry: Arc<MappingRegistry>,
    platform: Arc<MockPlatform>,
    publisher: Arc<RecordingPublisher>,
    processor: OutboundProcessor,
}

async fn harness() -> Harness {
    let registry = Arc::new(MappingRegistry::new(
        Arc::new(MemoryMappingStore::new()),
        ServiceConfiguration::default(),
    ));
    registry.initialize(TENANT);
    let platform = Arc::new(MockPlatform::new());
    platform.register_device("c8y_Serial", "sensor-1", "1001");
    let publisher = Arc::new(RecordingPublisher::new());
    let processor = OutboundProcessor::new(registry.clone(), platform.clone(), publisher.clone());

    let mapping = Mapping::outbound("temperature-out", "c8y_Temperature", "measurements/+", Api::Measurement)
        .with_target(r#"{"temperature": 0, "unit": "C"}"#)
        .with_external_id("c8y_Serial")
        .with_substitution(Substitution::identifier("_IDENTITY_.externalId", "_TOPIC_LEVEL_[1]"))
        .with_substitution(Substitution::new("c8y_Temperature.T.value", "temperature"))
        .activated();
    registry.create(TENANT, mapping).await.unwrap();

    Harness {
        registry,
        platform,
        publisher,
        processor,
    }
}

fn measurement(source: &str, value: f64) -> Value {
    json!({
        "source": {"id": source},
        "type": "c8y_Temperature",
        "c8y_Temperature": {"T": {"value": value, "unit": "C"}}
    })
}

#[tokio::test]
async fn test_publish_to_spliced_topic() {
    let h = harness().await;
    let contexts = h
        .processor
        .process(TENANT, Api::Measurement, &measurement("1001", 21.5), true)
        .await
        .unwrap();

    assert_eq!(contexts.len(), 1);
    let ctx = &contexts[0];
    assert!(!ctx.has_errors(), "{:?}", ctx.errors);
    assert_eq!(ctx.payload["_IDENTITY_"]["c8ySourceId"], json!("1001"));
    assert_eq!(ctx.payload["_IDENTITY_"]["externalId"], json!("sensor-1"));

    let request = &ctx.requests[0];
    assert_eq!(request.method, RequestMethod::Publish);
    assert_eq!(request.topic.as_deref(), Some("measurements/sensor-1"));

    let published = h.publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "measurements/sensor-1");
    let body: Value = serde_json::from_slice(&published[0].1).unwrap();
    assert_eq!(body, json!({"temperature": 21.5, "unit": "C"}));

    let status = h.registry.status(TENANT, "temperature-out").unwrap();
    assert_eq!(status.messages_received, 1);
}

#[tokio::test]
async fn test_resolution_requires_filter_and_api() {
    let h = harness().await;
    let no_fragment = json!({"source": {"id": "1001"}, "c8y_Humidity": {"H": {"value": 40}}});
    assert!(h
        .processor
        .process(TENANT, Api::Measurement, &no_fragment, true)
        .await
        .unwrap()
        .is_empty());
    assert!(h
        .processor
        .process(TENANT, Api::Event, &measurement("1001", 1.0), true)
        .await
        .unwrap()
        .is_empty());
    assert!(h.publisher.published().is_empty());
}

#[tokio::test]
async fn test_dry_run_does_not_publish() {
    let h = harness().await;
    let contexts = h
        .processor
        .process(TENANT, Api::Measurement, &measurement("1001", 3.0), false)
        .await
        .unwrap();
    assert_eq!(contexts[0].requests.len(), 1);
    assert_eq!(contexts[0].requests[0].payload["temperature"], json!(3.0));
    assert!(h.publisher.published().is_empty());
}

#[tokio::test]
async fn test_unknown_device_and_disconnected_transport() {
    let h = harness().await;

    // no external id: the identifier has nothing to pick
    let contexts = h
        .processor
        .process(TENANT, Api::Measurement, &measurement("9999", 1.0), true)
        .await
        .unwrap();
    assert!(!contexts[0].errors.is_empty());
    assert!(h.publisher.published().is_empty());

    h.publisher.disconnect();
    let contexts = h
        .processor
        .process(TENANT, Api::Measurement, &measurement("1001", 1.0), true)
        .await
        .unwrap();
    assert!(matches!(contexts[0].errors[0], ProcessingError::Publish(_)));
    assert!(contexts[0].requests[0].has_error());
    assert_eq!(h.registry.status(TENANT, "temperature-out").unwrap().errors, 2);
    assert!(!h.platform.calls().is_empty());
}
