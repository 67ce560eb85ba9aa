//! Mapping data model.
//!
//! A [`Mapping`] binds a topic pattern (inbound) or a filter path (outbound)
//! to a target payload template and an ordered list of [`Substitution`]s.

mod mapping;
mod status;
mod substitution;

pub use mapping::Mapping;
pub use status::MappingStatus;
pub use substitution::Substitution;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Synthetic payload field holding the topic levels of the message.
pub const TOKEN_TOPIC_LEVEL: &str = "_TOPIC_LEVEL_";
/// Synthetic payload field holding transport context data (message key).
pub const TOKEN_CONTEXT_DATA: &str = "_CONTEXT_DATA_";
/// Key under [`TOKEN_CONTEXT_DATA`] carrying the message key.
pub const CONTEXT_DATA_KEY_NAME: &str = "key";
/// Synthetic object holding device identity information.
pub const TOKEN_IDENTITY: &str = "_IDENTITY_";
/// Generic target path for an external device identifier.
pub const IDENTITY_EXTERNAL_ID: &str = "_IDENTITY_.externalId";
/// Generic target path for a platform internal device identifier.
pub const IDENTITY_SOURCE_ID: &str = "_IDENTITY_.c8ySourceId";
/// Target path of the object timestamp.
pub const TIME: &str = "time";

/// Platform API a mapping produces objects for (inbound) or listens to (outbound).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Api {
    Event,
    Alarm,
    Measurement,
    Inventory,
    Operation,
}

impl Api {
    /// Path of the device identifier inside objects of this API.
    pub fn identifier(&self) -> &'static str {
        match self {
            Api::Event | Api::Alarm | Api::Measurement => "source.id",
            Api::Inventory => "id",
            Api::Operation => "deviceId",
        }
    }

    /// Whether objects of this API carry a timestamp.
    pub fn has_time(&self) -> bool {
        matches!(self, Api::Event | Api::Alarm | Api::Measurement)
    }
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Api::Event => "EVENT",
            Api::Alarm => "ALARM",
            Api::Measurement => "MEASUREMENT",
            Api::Inventory => "INVENTORY",
            Api::Operation => "OPERATION",
        };
        f.write_str(name)
    }
}

/// Direction of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    #[default]
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("INBOUND"),
            Direction::Outbound => f.write_str("OUTBOUND"),
        }
    }
}

/// How a substitution reconciles a value list shorter than the fan-out width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairStrategy {
    #[default]
    Default,
    UseFirstValueOfArray,
    UseLastValueOfArray,
    RemoveIfMissing,
    CreateIfMissing,
}

/// Payload format of a mapping, selects the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingType {
    #[default]
    Json,
    FlatFile,
    GenericBinary,
    ProtobufStatic,
    ProcessorExtension,
}

/// Snoop state of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnoopStatus {
    #[default]
    None,
    Enabled,
    Started,
    Stopped,
}

impl SnoopStatus {
    /// Messages for a snooping mapping are recorded instead of processed.
    pub fn is_snooping(&self) -> bool {
        matches!(self, SnoopStatus::Enabled | SnoopStatus::Started)
    }
}
