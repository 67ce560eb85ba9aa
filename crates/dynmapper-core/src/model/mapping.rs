use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    Api, Direction, MappingType, SnoopStatus, Substitution, IDENTITY_EXTERNAL_ID,
    IDENTITY_SOURCE_ID,
};
use crate::error::{Error, Result};
use crate::topic;

/// A routing and transformation rule.
///
/// Inbound mappings are resolved by `subscription_topic`, outbound mappings by
/// `filter_outbound`. An active mapping only changes through snoop accumulation
/// and status counters; structural edits require deactivation first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    #[serde(default)]
    pub id: String,
    /// Stable human key, also used to key the mapping status.
    pub ident: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub subscription_topic: String,
    #[serde(default)]
    pub template_topic: String,
    #[serde(default)]
    pub template_topic_sample: String,
    #[serde(default)]
    pub publish_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_outbound: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_mapping: Option<String>,
    pub target_api: Api,
    /// Sample source payload used while authoring the mapping.
    #[serde(default)]
    pub source: String,
    /// Target payload template (JSON text).
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub mapping_type: MappingType,
    #[serde(default)]
    pub substitutions: Vec<Substitution>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub create_non_existing_device: bool,
    #[serde(default)]
    pub use_external_id: bool,
    #[serde(default)]
    pub external_id_type: String,
    #[serde(default)]
    pub snoop_status: SnoopStatus,
    #[serde(default)]
    pub snooped_templates: Vec<String>,
    #[serde(default)]
    pub qos: u8,
    /// Milliseconds since the epoch of the last persisted change.
    #[serde(default)]
    pub last_update: i64,
}

impl Mapping {
    /// Create an inbound mapping for a subscription topic.
    pub fn inbound(ident: impl Into<String>, subscription_topic: impl Into<String>, api: Api) -> Self {
        let subscription_topic = subscription_topic.into();
        Self {
            id: String::new(),
            ident: ident.into(),
            name: String::new(),
            direction: Direction::Inbound,
            template_topic: subscription_topic.clone(),
            template_topic_sample: String::new(),
            subscription_topic,
            publish_topic: String::new(),
            filter_outbound: None,
            filter_mapping: None,
            target_api: api,
            source: String::new(),
            target: String::new(),
            mapping_type: MappingType::Json,
            substitutions: Vec::new(),
            active: false,
            debug: false,
            create_non_existing_device: false,
            use_external_id: false,
            external_id_type: String::new(),
            snoop_status: SnoopStatus::None,
            snooped_templates: Vec::new(),
            qos: 0,
            last_update: 0,
        }
    }

    /// Create an outbound mapping listening for `filter_outbound` on `api` objects.
    pub fn outbound(
        ident: impl Into<String>,
        filter_outbound: impl Into<String>,
        publish_topic: impl Into<String>,
        api: Api,
    ) -> Self {
        let publish_topic = publish_topic.into();
        let mut mapping = Self::inbound(ident, String::new(), api);
        mapping.direction = Direction::Outbound;
        mapping.template_topic = String::new();
        mapping.filter_outbound = Some(filter_outbound.into());
        mapping.publish_topic = publish_topic;
        mapping
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_substitution(mut self, substitution: Substitution) -> Self {
        self.substitutions.push(substitution);
        self
    }

    pub fn with_external_id(mut self, external_id_type: impl Into<String>) -> Self {
        self.use_external_id = true;
        self.external_id_type = external_id_type.into();
        self
    }

    pub fn with_template_topic(mut self, template_topic: impl Into<String>) -> Self {
        self.template_topic = template_topic.into();
        self
    }

    pub fn with_mapping_type(mut self, mapping_type: MappingType) -> Self {
        self.mapping_type = mapping_type;
        self
    }

    pub fn creating_devices(mut self) -> Self {
        self.create_non_existing_device = true;
        self
    }

    pub fn activated(mut self) -> Self {
        self.active = true;
        self
    }

    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }

    /// Normalized subscription pattern used as the resolver tree key.
    pub fn pattern(&self) -> String {
        topic::normalize(&self.subscription_topic)
    }

    /// Move the identifier-defining substitution to the front, keeping the
    /// relative order of all others.
    pub fn sort_substitutions(&mut self) {
        self.substitutions
            .sort_by_key(|s| if s.defines_identifier { 0 } else { 1 });
    }

    /// The substitution yielding the device identifier.
    pub fn identifier_substitution(&self) -> Option<&Substitution> {
        self.substitutions.iter().find(|s| s.defines_identifier)
    }

    /// Rewrite a generic identity path to the target API's identifier path.
    pub fn resolve_target_path(&self, path: &str) -> String {
        for generic in [IDENTITY_EXTERNAL_ID, IDENTITY_SOURCE_ID] {
            if path == generic {
                return self.target_api.identifier().to_string();
            }
        }
        path.to_string()
    }

    /// Parse the target template, an empty template is an empty object.
    pub fn target_template(&self) -> Result<Value> {
        if self.target.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.target).map_err(|e| {
            Error::Serialization(format!("Invalid target template of mapping {}: {}", self.ident, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_substitutions_puts_identifier_first() {
        let mut mapping = Mapping::inbound("m1", "/device/+", Api::Measurement)
            .with_substitution(Substitution::new("p1s", "p1t"))
            .with_substitution(Substitution::identifier("p2s", "p2t"))
            .with_substitution(Substitution::new("p3s", "p3t"));

        assert_eq!(mapping.substitutions[0].path_source, "p1s");
        mapping.sort_substitutions();
        assert_eq!(mapping.substitutions[0].path_source, "p2s");
        assert_eq!(mapping.substitutions[1].path_source, "p1s");
        assert_eq!(mapping.substitutions[2].path_source, "p3s");
    }

    #[test]
    fn test_resolve_generic_identity_path() {
        let mapping = Mapping::inbound("m1", "/device/+", Api::Measurement);
        assert_eq!(mapping.resolve_target_path("_IDENTITY_.externalId"), "source.id");
        assert_eq!(mapping.resolve_target_path("c8y_Temperature.T"), "c8y_Temperature.T");

        let op = Mapping::inbound("m2", "/op/+", Api::Operation);
        assert_eq!(op.resolve_target_path("_IDENTITY_.c8ySourceId"), "deviceId");
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "ident": "abc",
            "subscriptionTopic": "/plant1/+/machine1",
            "targetApi": "MEASUREMENT",
            "substitutions": [
                {"pathSource": "value", "pathTarget": "c8y_Temperature.value"}
            ]
        }"#;
        let mapping: Mapping = serde_json::from_str(json).unwrap();
        assert_eq!(mapping.direction, Direction::Inbound);
        assert_eq!(mapping.mapping_type, MappingType::Json);
        assert!(!mapping.active);
        assert_eq!(mapping.substitutions.len(), 1);
        assert!(!mapping.substitutions[0].expand_array);
    }

    #[test]
    fn test_empty_target_template_is_object() {
        let mapping = Mapping::inbound("m1", "/a", Api::Event);
        assert_eq!(mapping.target_template().unwrap(), serde_json::json!({}));

        let broken = mapping.with_target("{not json");
        assert!(broken.target_template().is_err());
    }
}
