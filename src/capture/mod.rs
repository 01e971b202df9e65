//! Synchronised multi-rail capture.
//!
//! [`CaptureOrchestrator`] drives a set of [`CaptureDevice`]s: rail samplers
//! backed by an instrument session and an optional event logger reading the
//! target's log. The results are assembled into a [`Dataset`] on the rail
//! sample grid.

pub mod aligner;
pub mod dataset;
pub mod device;
pub mod event_log;
pub mod orchestrator;
pub mod rail;
pub mod sequence;

#[cfg(feature = "instrument_serial")]
mod factory;

pub use aligner::{align, GridRow, NOT_FOUND};
pub use dataset::{Dataset, RailColumn, StateSummary};
pub use device::{power_watts, CaptureData, CaptureDevice, CapturePlan, RailTrace};
pub use event_log::{EventLogger, EventRecord};
pub use orchestrator::{connect_devices, CaptureOrchestrator, POWER_SETTLE};
pub use rail::RailSampler;
pub use sequence::{power_off_order, power_on_order, RAIL_PRIORITY};

#[cfg(feature = "instrument_serial")]
pub use factory::open_serial_device;
