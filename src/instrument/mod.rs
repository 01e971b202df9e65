//! Power-measurement instrument driver.
//!
//! Layering, leaves first:
//!
//! - [`command`]: immutable command catalog
//! - [`channel`]: request/response transactions over a [`Transport`](crate::adapters::Transport)
//! - [`demux`]: splits the binary stream into samples and metadata frames
//! - [`stats`]: trimming and summary statistics
//! - [`session`]: validated configuration, power control and acquisition

pub mod channel;
pub mod command;
pub mod demux;
pub mod session;
pub mod stats;

pub use channel::{Reply, TransactionChannel};
pub use command::{CommandKind, CommandSpec};
pub use demux::{demultiplex, Demultiplexed, FrameKind, MetadataFrame, RawSample};
pub use session::{
    Acquisition, AcquisitionTime, DeviceSession, OutputFormat, SamplingRate, SessionSettings,
    SessionState, TemperatureScale, TriggerSource,
};
pub use stats::SampleStatistics;
