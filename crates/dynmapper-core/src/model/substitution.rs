use serde::{Deserialize, Serialize};

use super::RepairStrategy;

/// One extraction/assignment rule of a mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Substitution {
    /// Path expression evaluated against the source payload.
    pub path_source: String,
    /// Path assigned in the target template.
    pub path_target: String,
    #[serde(default)]
    pub repair_strategy: RepairStrategy,
    /// Expand an extracted array into one entry per element.
    #[serde(default)]
    pub expand_array: bool,
    /// This substitution yields the device identifier and defines the fan-out width.
    #[serde(default)]
    pub defines_identifier: bool,
}

impl Substitution {
    pub fn new(path_source: impl Into<String>, path_target: impl Into<String>) -> Self {
        Self {
            path_source: path_source.into(),
            path_target: path_target.into(),
            repair_strategy: RepairStrategy::Default,
            expand_array: false,
            defines_identifier: false,
        }
    }

    /// Create the identifier-defining substitution.
    pub fn identifier(path_source: impl Into<String>, path_target: impl Into<String>) -> Self {
        Self::new(path_source, path_target).defining_identifier()
    }

    pub fn with_repair_strategy(mut self, strategy: RepairStrategy) -> Self {
        self.repair_strategy = strategy;
        self
    }

    pub fn expanding_array(mut self) -> Self {
        self.expand_array = true;
        self
    }

    pub fn defining_identifier(mut self) -> Self {
        self.defines_identifier = true;
        self
    }
}
