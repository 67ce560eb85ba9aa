//! Inbound processing: transport message to platform requests.

use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;

use dynmapper_core::{
    path, Api, DeviceUpsert, Mapping, PlatformClient, SubstituteValue, TransportMessage,
};

use crate::codec::CodecRegistry;
use crate::context::{DeviceOutcome, PlatformRequest, ProcessingContext, RequestMethod};
use crate::dispatcher::{DeviceUnit, DispatchMode, Dispatcher};
use crate::error::ProcessingError;
use crate::registry::MappingRegistry;
use crate::substitution::{self, DeviceRow};

/// Turns transport messages into platform requests.
pub struct InboundProcessor {
    registry: Arc<MappingRegistry>,
    platform: Arc<dyn PlatformClient>,
    codecs: CodecRegistry,
    dispatcher: Dispatcher,
}

impl InboundProcessor {
    pub fn new(registry: Arc<MappingRegistry>, platform: Arc<dyn PlatformClient>) -> Self {
        let dispatcher = Dispatcher::from_config(registry.config());
        Self {
            registry,
            platform,
            codecs: CodecRegistry::default(),
            dispatcher,
        }
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Share a dispatcher (and its worker pool) with other processors.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Process one message against every matching active mapping.
    ///
    /// Returns one context per processed mapping. Only a failure to resolve
    /// mappings at all is returned as `Err`.
    pub async fn process(
        &self,
        message: &TransportMessage,
        send_payload: bool,
    ) -> Result<Vec<ProcessingContext>, ProcessingError> {
        let tenant = message.tenant.as_str();
        let mappings = self
            .registry
            .resolve_inbound(tenant, &message.topic)
            .map_err(|e| ProcessingError::Resolution(e.to_string()))?;

        if mappings.is_empty() {
            tracing::debug!("Tenant {} - No mapping for topic {}", tenant, message.topic);
            self.registry.increment_unspecified(tenant);
            return Ok(Vec::new());
        }

        let mut contexts = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            if !mapping.active {
                continue;
            }

            if mapping.snoop_status.is_snooping() {
                let sample = String::from_utf8_lossy(&message.payload).into_owned();
                if let Err(e) = self.registry.record_snoop(tenant, &mapping.id, sample) {
                    tracing::warn!("Tenant {} - Cannot snoop mapping {}: {}", tenant, mapping.ident, e);
                }
                self.registry
                    .update_status(tenant, &mapping, |status| status.messages_received += 1);
                continue;
            }

            let ctx = self.process_mapping(message, mapping.clone(), send_payload).await;
            if ctx.has_errors() {
                for error in &ctx.errors {
                    tracing::warn!("Tenant {} - Mapping {}: {}", tenant, mapping.ident, error);
                }
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
        message: &TransportMessage,
        mapping: Arc<Mapping>,
        send_payload: bool,
    ) -> ProcessingContext {
        let config = self.registry.config();
        let mut ctx = ProcessingContext::new(
            &message.tenant,
            &message.topic,
            mapping.clone(),
            Value::Null,
            send_payload,
        );
        ctx.key = message.key.clone();

        let payload = self
            .codecs
            .get(mapping.mapping_type)
            .and_then(|codec| codec.deserialize(&message.payload));
        let mut payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                ctx.add_error(ProcessingError::Deserialization {
                    mapping: mapping.ident.clone(),
                    reason: e.to_string(),
                });
                return ctx;
            }
        };
        substitution::enrich_inbound(&mut payload, &message.topic, message.key.as_deref());
        if config.log_payload {
            tracing::info!(
                "Tenant {} - Mapping {} payload on {}: {}",
                message.tenant,
                mapping.ident,
                message.topic,
                payload
            );
        }
        ctx.payload = payload;

        if let Some(filter) = &mapping.filter_mapping {
            match path::evaluate(&ctx.payload, filter) {
                Ok(Some(result)) if substitution::is_truthy(&result) => {}
                Ok(_) => {
                    tracing::debug!(
                        "Tenant {} - Mapping {} filter '{}' not satisfied",
                        message.tenant,
                        mapping.ident,
                        filter
                    );
                    ctx.ignore_further_processing = true;
                    return ctx;
                }
                Err(e) => {
                    ctx.add_error(ProcessingError::Filter {
                        filter: filter.clone(),
                        reason: e.to_string(),
                    });
                    return ctx;
                }
            }
        }

        let extraction = substitution::extract(&mapping, &ctx.payload);
        ctx.errors.extend(extraction.errors);
        let mut cache = extraction.cache;
        if config.inject_time_if_missing {
            substitution::inject_time(&mapping, &mut cache);
        }

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

        let template = match mapping.target_template() {
            Ok(template) => Arc::new(template),
            Err(e) => {
                ctx.add_error(ProcessingError::Deserialization {
                    mapping: mapping.ident.clone(),
                    reason: e.to_string(),
                });
                return ctx;
            }
        };

        let units: Vec<DeviceUnit> = rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| match row {
                Ok(row) => {
                    let job = DeviceJob {
                        platform: self.platform.clone(),
                        tenant: message.tenant.clone(),
                        mapping: mapping.clone(),
                        template: template.clone(),
                        identifier_path: identifier_path.clone(),
                        row,
                        send_payload,
                        log_substitution: config.log_substitution,
                    };
                    job.run().boxed()
                }
                Err(e) => async move { DeviceOutcome::failed(index, Vec::new(), e) }.boxed(),
            })
            .collect();

        let mode = if mapping.create_non_existing_device {
            DispatchMode::Sequential
        } else {
            DispatchMode::Parallel
        };
        for outcome in self.dispatcher.dispatch(mode, units).await {
            ctx.merge_outcome(outcome);
        }
        ctx
    }
}

/// Everything one device unit needs, owned so the unit can run as a task.
struct DeviceJob {
    platform: Arc<dyn PlatformClient>,
    tenant: String,
    mapping: Arc<Mapping>,
    template: Arc<Value>,
    identifier_path: String,
    row: DeviceRow,
    send_payload: bool,
    log_substitution: bool,
}

impl DeviceJob {
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
        let external_id = self
            .row
            .identifier
            .as_text()
            .ok_or_else(|| ProcessingError::MissingIdentifier(self.identifier_path.clone()))?;

        let mut row = self.row.clone();
        let mut predecessor = None;
        if mapping.target_api != Api::Inventory && mapping.use_external_id {
            let resolved = self
                .platform
                .resolve_external_id(&self.tenant, &mapping.external_id_type, &external_id)
                .await?;
            let source_id = match resolved {
                Some(id) => Some(id),
                None if mapping.create_non_existing_device => {
                    predecessor = Some(requests.len());
                    Some(self.create_device(requests, &external_id).await?)
                }
                None if self.send_payload => {
                    return Err(ProcessingError::IdentifierNotFound {
                        external_id_type: mapping.external_id_type.clone(),
                        external_id,
                    });
                }
                None => {
                    tracing::warn!(
                        "Tenant {} - Mapping {} device {}: external id {} of type {} not found",
                        self.tenant,
                        mapping.ident,
                        index,
                        external_id,
                        mapping.external_id_type
                    );
                    None
                }
            };
            if let Some(source_id) = source_id {
                let strategy = row.identifier.repair_strategy;
                row = row.with_identifier(
                    &self.identifier_path,
                    SubstituteValue::new(Value::String(source_id), strategy),
                );
            }
        }

        let payload = substitution::build_target(&self.template, &row, &self.identifier_path)?;
        if self.log_substitution {
            tracing::info!(
                "Tenant {} - Mapping {} device {}: {}",
                self.tenant,
                mapping.ident,
                index,
                payload
            );
        }

        let method = if mapping.target_api == Api::Inventory {
            RequestMethod::Put
        } else {
            RequestMethod::Post
        };
        let mut request = PlatformRequest::new(index, method, mapping.target_api, payload)
            .with_predecessor(predecessor)
            .with_external_id_type(mapping.external_id_type.clone());
        request.source = row.identifier.as_text();

        if self.send_payload {
            let response = if mapping.target_api == Api::Inventory {
                self.upsert_inventory(&request.payload, &external_id).await
            } else {
                self.platform
                    .create_object(&self.tenant, mapping.target_api, &request.payload)
                    .await
                    .map_err(ProcessingError::from)
            };
            match response {
                Ok(value) => request.response = Some(value),
                Err(e) => {
                    request.error = Some(e.clone());
                    requests.push(request);
                    return Err(e);
                }
            }
        }
        requests.push(request);
        Ok(())
    }

    /// Create the device for an unknown external id and return its internal id.
    async fn create_device(
        &self,
        requests: &mut Vec<PlatformRequest>,
        external_id: &str,
    ) -> Result<String, ProcessingError> {
        let mapping = &self.mapping;
        let device = DeviceUpsert::auto_created(&mapping.external_id_type, external_id);
        let payload = serde_json::to_value(&device).map_err(|e| ProcessingError::Substitution {
            path: mapping.target_api.identifier().to_string(),
            reason: e.to_string(),
        })?;
        let mut request = PlatformRequest::new(self.row.index, RequestMethod::Put, Api::Inventory, payload)
            .with_external_id_type(mapping.external_id_type.clone());

        if !self.send_payload {
            requests.push(request);
            return Ok(external_id.to_string());
        }

        match self.platform.create_or_update_device(&self.tenant, &device).await {
            Ok(created) => {
                tracing::info!(
                    "Tenant {} - Created device {} for external id {}",
                    self.tenant,
                    created.id,
                    external_id
                );
                request.source = Some(created.id.clone());
                request.response = serde_json::to_value(&created).ok();
                requests.push(request);
                Ok(created.id)
            }
            Err(e) => {
                let error = ProcessingError::from(e);
                request.error = Some(error.clone());
                requests.push(request);
                Err(error)
            }
        }
    }

    /// Inventory targets are upserted by external id, or updated in place
    /// when the identifier already is the internal id.
    async fn upsert_inventory(&self, payload: &Value, identifier: &str) -> Result<Value, ProcessingError> {
        let mapping = &self.mapping;
        if !mapping.use_external_id {
            return Ok(self
                .platform
                .update_inventory(&self.tenant, identifier, payload)
                .await?);
        }
        let mut device = DeviceUpsert::auto_created(&mapping.external_id_type, identifier);
        if let Some(name) = payload.get("name").and_then(Value::as_str) {
            device.name = name.to_string();
        }
        if let Some(device_type) = payload.get("type").and_then(Value::as_str) {
            device.device_type = device_type.to_string();
        }
        device.fragments = payload.clone();
        let created = self.platform.create_or_update_device(&self.tenant, &device).await?;
        serde_json::to_value(created).map_err(|e| ProcessingError::Platform(e.to_string()))
    }
}
