//! Processing engine of the dynamic mapper.
//!
//! - [`registry`]: per tenant mapping caches with copy-on-write snapshots
//! - [`substitution`]: extraction, arity repair and target building
//! - [`dispatcher`]: bounded fan-out of device units
//! - [`inbound`] / [`outbound`]: the two processing directions
//! - [`codec`]: payload codecs by mapping type
//! - [`mock`]: in-memory platform and publisher

pub mod codec;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod inbound;
pub mod mock;
pub mod outbound;
pub mod registry;
pub mod substitution;

pub use codec::{CodecError, CodecRegistry, PayloadCodec};
pub use context::{DeviceOutcome, PlatformRequest, ProcessingCache, ProcessingContext, RequestMethod};
pub use dispatcher::{DeviceUnit, DispatchMode, Dispatcher};
pub use error::ProcessingError;
pub use inbound::InboundProcessor;
pub use mock::{MockPlatform, PlatformCall, RecordingPublisher};
pub use outbound::OutboundProcessor;
pub use registry::{MappingRegistry, TenantSnapshot};
