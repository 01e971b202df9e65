//! Synchronised multi-rail power capture.
//!
//! The crate drives serial power-measurement instruments, one per supply rail,
//! and optionally a target-side event log, then aligns everything on a common
//! sample grid:
//!
//! - [`adapters`]: blocking byte transports (serial port, scripted mock)
//! - [`instrument`]: command protocol, device session and stream demultiplexing
//! - [`capture`]: power sequencing, concurrent capture and event alignment
//! - [`config`]: Figment-based settings
//! - [`storage`]: CSV output
//! - [`logging`]: injected leveled reporting

pub mod adapters;
pub mod capture;
pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod storage;

pub use error::{AppResult, DaqError};
