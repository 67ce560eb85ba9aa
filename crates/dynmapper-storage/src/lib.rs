//! Mapping persistence backends.
//!
//! | Backend | Description |
//! |---------|-------------|
//! | [`MemoryMappingStore`] | In-memory, for tests and ephemeral deployments |
//! | [`RedbMappingStore`] | Persistent embedded database |
//!
//! Both implement [`dynmapper_core::MappingStore`].

pub mod error;
pub mod memory;
pub mod redb_store;

pub use error::{Error, Result};
pub use memory::MemoryMappingStore;
pub use redb_store::RedbMappingStore;
