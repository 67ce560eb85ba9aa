//! Outbound processing: platform events to transport publishes.

use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Value};

use dynmapper_core::model::TOKEN_IDENTITY;
use dynmapper_core::model::TOKEN_TOPIC_LEVEL;
use dynmapper_core::{path, topic, Api, Mapping, PlatformClient, TransportPublisher};

use crate::codec::{CodecRegistry, PayloadCodec};
use crate::context::{DeviceOutcome, PlatformRequest, ProcessingContext, RequestMethod};
use crate::dispatcher::{DeviceUnit, DispatchMode, Dispatcher};
use crate::error::ProcessingError;
use crate::registry::MappingRegistry;
use crate::substitution::{self, DeviceRow};

/// Renders platform events into transport payloads and publishes them.
pub struct OutboundProcessor {
    registry: Arc<MappingRegistry>,
    platform: Arc<dyn PlatformClient>,
    publisher: Arc<dyn TransportPublisher>,
    codecs: CodecRegistry,
    dispatcher: Dispatcher,
}

impl OutboundProcessor {
    pub fn new(
        registry: Arc<MappingRegistry>,
        platform: Arc<dyn PlatformClient>,
        publisher: Arc<dyn TransportPublisher>,
    ) -> Self {
        let dispatcher = Dispatcher::from_config(registry.config());
        Self {
            registry,
            platform,
            publisher,
            codecs: CodecRegistry::default(),
            dispatcher,
        }
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Process one platform event of `api` against every matching active
    /// outbound mapping.
    pub async fn process(
        &self,
        tenant: &str,
        api: Api,
        event: &Value,
        send_payload: bool,
    ) -> Result<Vec<ProcessingContext>, ProcessingError> {
        let mappings = self
            .registry
            .resolve_outbound(tenant, event, api)
            .map_err(|e| ProcessingError::Resolution(e.to_string()))?;

        let mut contexts = Vec::with_capacity(mappings.len());
        for mapping in mappings.into_iter().filter(|m| m.active) {
            let ctx = self.process_mapping(tenant, api, event, mapping.clone(), send_payload).await;
            for error in &ctx.errors {
                tracing::warn!("Tenant {} - Outbound mapping {}: {}", tenant, mapping.ident, error);
            }
            let failed = ctx.has_errors();
            self.registry.update_status(tenant, &mapping, |status| {
                status.messages_received += 1;
                if failed {
                    status.errors += 1;
                }
            });
            contexts.push(ctx);
        }
        Ok(contexts)
    }

    async fn process_mapping(
        &self,
        tenant: &str,
        api: Api,
        event: &Value,
        mapping: Arc<Mapping>,
        send_payload: bool,
    ) -> ProcessingContext {
        let config = self.registry.config();
        let mut payload = event.clone();
        self.enrich_identity(tenant, api, &mapping, &mut payload).await;
        let mut ctx = ProcessingContext::new(tenant, &mapping.publish_topic, mapping.clone(), payload, send_payload);

        let codec = match self.codecs.get(mapping.mapping_type) {
            Ok(codec) => codec,
            Err(e) => {
                ctx.add_error(ProcessingError::Serialization {
                    mapping: mapping.ident.clone(),
                    reason: e.to_string(),
                });
                return ctx;
            }
        };

        let extraction = substitution::extract(&mapping, &ctx.payload);
        ctx.errors.extend(extraction.errors);
        let cache = extraction.cache;

        let identifier_path = substitution::identifier_path(&mapping);
        let rows = match substitution::reconcile(&cache, &identifier_path) {
            Ok(rows) => rows,
            Err(e) => {
                ctx.add_error(e);
                ctx.processing_cache = cache;
                return ctx;
            }
        };
        ctx.device_entries = cache.get(&identifier_path).cloned().unwrap_or_default();
        ctx.processing_cache = cache;

        let mut template = match mapping.target_template() {
            Ok(template) => template,
            Err(e) => {
                ctx.add_error(ProcessingError::Serialization {
                    mapping: mapping.ident.clone(),
                    reason: e.to_string(),
                });
                return ctx;
            }
        };
        if let Value::Object(map) = &mut template {
            map.insert(
                TOKEN_TOPIC_LEVEL.to_string(),
                json!(topic::topic_levels(&mapping.publish_topic)),
            );
        }
        let template = Arc::new(template);

        let units: Vec<DeviceUnit> = rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| match row {
                Ok(row) => PublishJob {
                    publisher: self.publisher.clone(),
                    codec: codec.clone(),
                    tenant: tenant.to_string(),
                    mapping: mapping.clone(),
                    template: template.clone(),
                    identifier_path: identifier_path.clone(),
                    row,
                    send_payload,
                    log_substitution: config.log_substitution,
                }
                .run()
                .boxed(),
                Err(e) => async move { DeviceOutcome::failed(index, Vec::new(), e) }.boxed(),
            })
            .collect();

        for outcome in self.dispatcher.dispatch(DispatchMode::Parallel, units).await {
            ctx.merge_outcome(outcome);
        }
        ctx
    }

    /// Add `_IDENTITY_` with the platform source id and, when the mapping
    /// uses external ids, the device's external id.
    async fn enrich_identity(&self, tenant: &str, api: Api, mapping: &Mapping, payload: &mut Value) {
        let source_id = match path::evaluate(payload, api.identifier()) {
            Ok(Some(Value::String(id))) => Some(id),
            Ok(Some(Value::Number(id))) => Some(id.to_string()),
            _ => None,
        };

        let mut identity = json!({
            "c8ySourceId": source_id.clone(),
            "externalIdType": mapping.external_id_type,
        });
        if let (Some(source_id), true) = (&source_id, mapping.use_external_id) {
            match self
                .platform
                .find_external_id(tenant, source_id, &mapping.external_id_type)
                .await
            {
                Ok(Some(external_id)) => identity["externalId"] = Value::String(external_id),
                Ok(None) => tracing::debug!(
                    "Tenant {} - No external id of type {} for device {}",
                    tenant,
                    mapping.external_id_type,
                    source_id
                ),
                Err(e) => tracing::warn!(
                    "Tenant {} - External id lookup for device {} failed: {}",
                    tenant,
                    source_id,
                    e
                ),
            }
        }
        if let Value::Object(map) = payload {
            map.insert(TOKEN_IDENTITY.to_string(), identity);
        }
    }
}

struct PublishJob {
    publisher: Arc<dyn TransportPublisher>,
    codec: Arc<dyn PayloadCodec>,
    tenant: String,
    mapping: Arc<Mapping>,
    template: Arc<Value>,
    identifier_path: String,
    row: DeviceRow,
    send_payload: bool,
    log_substitution: bool,
}

impl PublishJob {
    async fn run(self) -> DeviceOutcome {
        let index = self.row.index;
        let mut requests = Vec::new();
        match self.execute(&mut requests).await {
            Ok(()) => DeviceOutcome::succeeded(index, requests),
            Err(e) => DeviceOutcome::failed(index, requests, e),
        }
    }

    async fn execute(&self, requests: &mut Vec<PlatformRequest>) -> Result<(), ProcessingError> {
        let mapping = &self.mapping;
        let index = self.row.index;
        if self.row.identifier.is_ignore() {
            return Err(ProcessingError::MissingIdentifier(self.identifier_path.clone()));
        }
        let mut payload = substitution::build_target(&self.template, &self.row, &self.identifier_path)?;

        let levels = match &mut payload {
            Value::Object(map) => map.remove(TOKEN_TOPIC_LEVEL),
            _ => None,
        };
        let levels: Vec<String> = match levels {
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };
        let publish_topic = topic::splice_levels(&mapping.publish_topic, &levels);

        if self.log_substitution {
            tracing::info!(
                "Tenant {} - Outbound mapping {} device {} to {}: {}",
                self.tenant,
                mapping.ident,
                index,
                publish_topic,
                payload
            );
        }

        let bytes = self
            .codec
            .serialize(&payload)
            .map_err(|e| ProcessingError::Serialization {
                mapping: mapping.ident.clone(),
                reason: e.to_string(),
            })?;

        let mut request = PlatformRequest::new(index, RequestMethod::Publish, mapping.target_api, payload)
            .with_external_id_type(mapping.external_id_type.clone());
        request.source = self.row.identifier.as_text();
        request.topic = Some(publish_topic.clone());

        if self.send_payload {
            if let Err(e) = self
                .publisher
                .publish(&self.tenant, &publish_topic, bytes, mapping.qos)
                .await
            {
                let error = ProcessingError::from(e);
                request.error = Some(error.clone());
                requests.push(request);
                return Err(error);
            }
        }
        requests.push(request);
        Ok(())
    }
}
