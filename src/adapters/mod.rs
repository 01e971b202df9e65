//! Byte transports underneath the instrument protocol.
//!
//! The command channel and the sample stream of an instrument both travel over
//! a [`Transport`]. Transports are blocking and owned exclusively by one device
//! session; capture workers run them on Tokio's blocking pool.

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial_adapter;

pub use mock::{MockHandle, MockTransport};
#[cfg(feature = "instrument_serial")]
pub use serial_adapter::{available_ports, is_power_monitor_description, PortInfo, SerialAdapter};

use crate::error::AppResult;

/// Blocking, byte-oriented channel to a single instrument.
pub trait Transport: Send {
    /// Identifier of the underlying port, used in log and error messages.
    fn port_name(&self) -> &str;

    /// Write the whole buffer and flush it to the device.
    fn write_all(&mut self, bytes: &[u8]) -> AppResult<()>;

    /// Read whatever is currently available into `buf` without waiting for more.
    ///
    /// Returns `0` when nothing is pending.
    fn read_available(&mut self, buf: &mut [u8]) -> AppResult<usize>;

    /// Number of bytes waiting in the input buffer.
    fn bytes_available(&mut self) -> AppResult<usize>;

    /// Discard pending input and output.
    fn clear(&mut self) -> AppResult<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn port_name(&self) -> &str {
        (**self).port_name()
    }

    fn write_all(&mut self, bytes: &[u8]) -> AppResult<()> {
        (**self).write_all(bytes)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        (**self).read_available(buf)
    }

    fn bytes_available(&mut self) -> AppResult<usize> {
        (**self).bytes_available()
    }

    fn clear(&mut self) -> AppResult<()> {
        (**self).clear()
    }
}
