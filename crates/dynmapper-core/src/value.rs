//! Extracted substitution values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::RepairStrategy;

/// Structural type of an extracted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueKind {
    Array,
    Ignore,
    Number,
    Object,
    Textual,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Ignore,
            Value::Number(_) => ValueKind::Number,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
            Value::String(_) | Value::Bool(_) => ValueKind::Textual,
        }
    }
}

/// A value extracted for one target path, tagged with its kind and the
/// repair strategy of the substitution that produced it.
///
/// Values are never mutated after extraction; every device unit builds its
/// target from shared references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubstituteValue {
    pub value: Value,
    pub kind: ValueKind,
    pub repair_strategy: RepairStrategy,
}

impl SubstituteValue {
    pub fn new(value: Value, repair_strategy: RepairStrategy) -> Self {
        Self {
            kind: ValueKind::of(&value),
            value,
            repair_strategy,
        }
    }

    /// Placeholder for a path that selected nothing.
    pub fn ignore(repair_strategy: RepairStrategy) -> Self {
        Self {
            value: Value::Null,
            kind: ValueKind::Ignore,
            repair_strategy,
        }
    }

    pub fn is_ignore(&self) -> bool {
        self.kind == ValueKind::Ignore
    }

    /// Empty for `REMOVE_IF_MISSING` purposes: nothing selected, or an empty string.
    pub fn is_empty(&self) -> bool {
        match &self.value {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Textual form used for identifiers: strings as-is, everything else as JSON.
    pub fn as_text(&self) -> Option<String> {
        match &self.value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}
