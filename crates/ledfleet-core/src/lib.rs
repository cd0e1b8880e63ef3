//! ledfleet Core - Shared types for LED fleet distribution
//!
//! This crate provides the domain types shared between the wire codec
//! (`ledfleet-protocol`) and the distribution engine (`ledfleetd`):
//! pixels and segment extraction, the data-driven site topology, device
//! status records, and the capability traits the engine is wired through.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or unchecked indexing.

pub mod error;
pub mod pixel;
pub mod producer;
pub mod site;
pub mod status;
pub mod telemetry;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use pixel::{extract_segment, Rgb};
pub use producer::{FrameProducer, ProducerError, ProducerSpec};
pub use site::{
    ChannelDescriptor, ClockFormat, DaySet, ScheduleEntry, ScheduleWindow, SiteDescriptor,
    TimeOfDay, DEFAULT_DEVICE_PORT,
};
pub use status::{ConnectionState, StatusResponse};
pub use telemetry::{
    ChannelStatus, FleetSnapshot, NullTelemetry, SiteStatus, TelemetryLine, TelemetrySink,
};
