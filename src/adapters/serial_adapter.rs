//! RS-232 / USB-serial transport backed by the `serialport` crate.

use super::Transport;
use crate::error::{AppResult, DaqError};
use log::debug;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use std::fmt::Display;
use std::io::{Read, Write};
use std::time::Duration;

/// Serial adapter for RS-232 communication
///
/// Opens the port 8-N-1 without flow control. The port-level timeout is kept
/// short; callers implement their own deadlines on top of
/// [`Transport::read_available`].
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyACM0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 100000, 115200)
    baud_rate: u32,

    port: Box<dyn SerialPort>,
}

impl SerialAdapter {
    /// Open `port_name` at `baud_rate`.
    ///
    /// # Errors
    /// Returns [`DaqError::Communication`] if the port cannot be opened.
    pub fn open(port_name: &str, baud_rate: u32) -> AppResult<Self> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| {
                DaqError::Communication(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    port_name, baud_rate, e
                ))
            })?;

        debug!("Serial port '{}' opened at {} baud", port_name, baud_rate);

        Ok(Self {
            port_name: port_name.to_string(),
            baud_rate,
            port,
        })
    }

    /// Baud rate the port was opened with.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

/// Map a fault of an open port to a communication error.
fn port_fault(port_name: &str, operation: &str, err: impl Display) -> DaqError {
    DaqError::Communication(format!("Failed to {} serial port '{}': {}", operation, port_name, err))
}

impl Transport for SerialAdapter {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn write_all(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.port
            .write_all(bytes)
            .map_err(|e| port_fault(&self.port_name, "write", e))?;
        self.port
            .flush()
            .map_err(|e| port_fault(&self.port_name, "flush", e))
    }

    fn read_available(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        let pending = self.bytes_available()?;
        if pending == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = pending.min(buf.len());
        match self.port.read(&mut buf[..want]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(port_fault(&self.port_name, "read", e)),
        }
    }

    fn bytes_available(&mut self) -> AppResult<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(|e| port_fault(&self.port_name, "poll", e))
    }

    fn clear(&mut self) -> AppResult<()> {
        self.port
            .clear(ClearBuffer::All)
            .map_err(|e| port_fault(&self.port_name, "clear", e))
    }
}

impl Drop for SerialAdapter {
    fn drop(&mut self) {
        debug!("Serial port '{}' closed", self.port_name);
    }
}

/// A serial port visible to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Name to pass to [`SerialAdapter::open`].
    pub name: String,
    /// USB serial number, tells several instruments apart.
    pub serial_number: Option<String>,
    /// USB manufacturer and product strings.
    pub description: Option<String>,
    /// The port is the command channel of a power monitor.
    pub is_power_monitor: bool,
}

/// Whether a USB description names the power channel of an ST-Link,
/// e.g. `STMicroelectronics STLink Virtual COM Port PWR`.
pub fn is_power_monitor_description(description: &str) -> bool {
    let folded: String = description
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    folded.contains("STLINK") && folded.contains("PWR")
}

/// Serial ports currently visible to the host.
pub fn available_ports() -> AppResult<Vec<PortInfo>> {
    let ports = serialport::available_ports()
        .map_err(|e| DaqError::Communication(format!("Failed to enumerate serial ports: {}", e)))?;
    Ok(ports
        .into_iter()
        .map(|p| match p.port_type {
            SerialPortType::UsbPort(usb) => {
                let description = [usb.manufacturer, usb.product]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                let description = (!description.is_empty()).then_some(description);
                PortInfo {
                    is_power_monitor: description
                        .as_deref()
                        .is_some_and(is_power_monitor_description),
                    name: p.port_name,
                    serial_number: usb.serial_number,
                    description,
                }
            }
            _ => PortInfo {
                name: p.port_name,
                serial_number: None,
                description: None,
                is_power_monitor: false,
            },
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_port_fault_is_communication_error() {
        let err = port_fault(
            "/dev/ttyACM0",
            "read",
            io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"),
        );
        match err {
            DaqError::Communication(msg) => {
                assert!(msg.contains("/dev/ttyACM0"));
                assert!(msg.contains("device unplugged"));
            }
            other => panic!("expected a communication error, got {other:?}"),
        }
    }

    #[test]
    fn test_power_monitor_descriptions() {
        assert!(is_power_monitor_description(
            "STMicroelectronics STLink Virtual COM Port PWR"
        ));
        assert!(is_power_monitor_description("ST-Link VCP-PWR Ctrl"));
        assert!(!is_power_monitor_description(
            "STMicroelectronics STLink Virtual COM Port"
        ));
        assert!(!is_power_monitor_description("FTDI FT232R USB UART"));
    }
}
