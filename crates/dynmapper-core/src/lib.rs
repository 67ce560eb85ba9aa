//! Core types of the dynamic mapper.
//!
//! - [`model`]: mappings, substitutions and status counters
//! - [`topic`]: topic normalization and wildcard matching
//! - [`tree`]: the per tenant resolver tree
//! - [`path`]: path expressions used by substitutions
//! - [`validation`]: mapping validation surface
//! - [`platform`], [`store`], [`transport`]: collaborator contracts

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod path;
pub mod platform;
pub mod store;
pub mod topic;
pub mod transport;
pub mod tree;
pub mod validation;
pub mod value;

pub use config::ServiceConfiguration;
pub use error::{Error, Result};
pub use model::{
    Api, Direction, Mapping, MappingStatus, MappingType, RepairStrategy, SnoopStatus, Substitution,
};
pub use platform::{DeviceUpsert, ManagedObject, PlatformClient, PlatformError};
pub use store::{MappingStore, StoreError};
pub use transport::{TransportError, TransportMessage, TransportPublisher};
pub use tree::MappingTree;
pub use validation::ValidationError;
pub use value::{SubstituteValue, ValueKind};
