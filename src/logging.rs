//! Leveled reporting sink handed to each component.
//!
//! Components never consult a process-wide logging configuration directly. They
//! receive a [`Reporter`] that carries its own `log` target and level ceiling;
//! records that pass the ceiling are forwarded to the `log` facade, where the
//! binary's `env_logger` decides how to print them.

use log::{Level, LevelFilter};
use std::fmt;

/// Per-component reporting handle.
#[derive(Clone, Debug)]
pub struct Reporter {
    target: String,
    ceiling: LevelFilter,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new("rail_daq", LevelFilter::Info)
    }
}

impl Reporter {
    /// Reporter emitting under `target` for records at or above `ceiling`.
    pub fn new(target: impl Into<String>, ceiling: LevelFilter) -> Self {
        Self {
            target: target.into(),
            ceiling,
        }
    }

    /// Reporter that drops everything.
    pub fn silent() -> Self {
        Self::new("rail_daq", LevelFilter::Off)
    }

    /// Derived reporter for a sub-component, e.g. one device of a capture run.
    pub fn scoped(&self, scope: &str) -> Self {
        Self {
            target: format!("{}::{}", self.target, scope),
            ceiling: self.ceiling,
        }
    }

    /// Same target with a different ceiling.
    pub fn with_ceiling(mut self, ceiling: LevelFilter) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// The `log` target records are emitted under.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether a record at `level` would be forwarded.
    pub fn enabled(&self, level: Level) -> bool {
        level <= self.ceiling
    }

    /// Forward a record if `level` passes the ceiling.
    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if self.enabled(level) {
            log::log!(target: self.target.as_str(), level, "{}", args);
        }
    }

    #[allow(missing_docs)]
    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args)
    }

    #[allow(missing_docs)]
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args)
    }

    #[allow(missing_docs)]
    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args)
    }

    #[allow(missing_docs)]
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args)
    }
}
