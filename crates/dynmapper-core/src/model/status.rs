use serde::{Deserialize, Serialize};

/// Per mapping processing counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MappingStatus {
    pub id: String,
    pub ident: String,
    pub subscription_topic: String,
    pub messages_received: u64,
    pub errors: u64,
    pub snooped_templates_active: u64,
    pub snooped_templates_total: u64,
}

impl MappingStatus {
    /// Ident and id of the status counting messages that matched no mapping.
    pub const UNSPECIFIED: &'static str = "#";

    pub fn new(id: impl Into<String>, ident: impl Into<String>, subscription_topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ident: ident.into(),
            subscription_topic: subscription_topic.into(),
            ..Default::default()
        }
    }

    pub fn unspecified() -> Self {
        Self::new(Self::UNSPECIFIED, Self::UNSPECIFIED, "#")
    }

    pub fn reset(&mut self) {
        self.messages_received = 0;
        self.errors = 0;
        self.snooped_templates_active = 0;
        self.snooped_templates_total = 0;
    }
}
