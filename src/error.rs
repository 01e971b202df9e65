//! Custom error types for the application.
//!
//! `DaqError` is the single error type shared by the instrument, capture and
//! storage layers. Built with `thiserror`, it separates the failure kinds that a
//! caller is expected to react to differently:
//!
//! - **`Configuration`**: a parameter was rejected during validation. The field is
//!   named so the operator can fix the capture settings. Nothing was applied.
//! - **`Communication`**: the instrument did not acknowledge a command, echoed an
//!   unexpected state, or the serial handle faulted.
//! - **`ProtocolDecode`**: the sample stream contained a metadata frame that
//!   cannot be decoded from the captured bytes.
//! - **`Timeout`**: a reply delimiter or the requested byte count never arrived.
//!
//! The remaining variants wrap ambient failures (I/O, configuration loading, CSV
//! output, worker tasks, disabled cargo features).

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Invalid {field}: {reason}")]
    Configuration { field: &'static str, reason: String },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("Timed out after {timeout:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        timeout: Duration,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Capture worker for '{device}' failed: {reason}")]
    Worker { device: String, reason: String },

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    pub(crate) fn configuration(field: &'static str, reason: impl Into<String>) -> Self {
        DaqError::Configuration {
            field,
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors that only concern the parameters handed in by the
    /// caller, i.e. the device itself is still usable.
    pub fn is_configuration(&self) -> bool {
        matches!(self, DaqError::Configuration { .. })
    }
}

#[cfg(feature = "instrument_serial")]
impl From<serialport::Error> for DaqError {
    fn from(err: serialport::Error) -> Self {
        DaqError::Communication(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::configuration("voltage", "4000 mV is outside [1600, 3600] mV");
        assert_eq!(
            err.to_string(),
            "Invalid voltage: 4000 mV is outside [1600, 3600] mV"
        );
        assert!(err.is_configuration());
    }

    #[test]
    fn test_timeout_display() {
        let err = DaqError::Timeout {
            waiting_for: "reply to 'version'".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("reply to 'version'"));
        assert!(!err.is_configuration());
    }
}
