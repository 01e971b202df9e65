//! Scripted in-memory transport for exercising the protocol without hardware.
//!
//! Replies are registered per command prefix. Writing a command line that
//! starts with a registered prefix queues the scripted reply on the input side,
//! exactly as a device would answer it. [`MockTransport::power_monitor`] scripts
//! a whole instrument that acknowledges every configuration command.
//!
//! ```
//! use rail_daq::adapters::{MockTransport, Transport};
//!
//! let mut port = MockTransport::new("mock0").reply("version", b"ack version 1.2\r\n\r\n");
//! port.write_all(b"version\r\n").unwrap();
//! assert_eq!(port.bytes_available().unwrap(), 19);
//! ```

use super::Transport;
use crate::error::{AppResult, DaqError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct MockState {
    rx: VecDeque<u8>,
    written: Vec<String>,
    clears: usize,
}

/// Shared view of a [`MockTransport`] that survives the transport being moved
/// into a session.
#[derive(Clone, Default)]
pub struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Command lines written so far, without their line terminator.
    pub fn written(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    /// Number of times the buffers were cleared.
    pub fn clears(&self) -> usize {
        self.lock().clears
    }

    /// Queue unsolicited bytes on the input side.
    pub fn push_input(&self, bytes: &[u8]) {
        self.lock().rx.extend(bytes.iter().copied());
    }
}

/// In-memory [`Transport`] answering commands from a script.
pub struct MockTransport {
    name: String,
    rules: Vec<(String, Vec<u8>)>,
    fail_writes: bool,
    handle: MockHandle,
}

impl MockTransport {
    /// Create a transport with no scripted replies.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Vec::new(),
            fail_writes: false,
            handle: MockHandle::default(),
        }
    }

    /// Instrument that passes the identification handshake and acknowledges
    /// configuration, trigger, power, temperature and `stop` commands.
    ///
    /// Nothing answers `start`; register the stream with [`reply`](Self::reply).
    pub fn power_monitor(name: &str) -> Self {
        Self::new(name)
            .reply("powershield", b"ack STLINK-V3PWR\r\n\r\n")
            .ack("version", "3.1.2")
            .ack("power_monitor", "")
            .ack("volt", "")
            .ack("acqtime", "")
            .ack("format", "")
            .ack("freq", "")
            .ack("trigsrc", "")
            .ack("trigdelay", "")
            .ack("pwr on", "")
            .ack("pwr off", "")
            .ack("temp degc", "24.5")
            .ack("temp degf", "76.1")
            .ack("temp refresh pcb", "27.25")
            .ack("stop", "")
    }

    /// Answer any command line starting with `prefix` with `bytes`.
    ///
    /// The most recently registered matching rule wins, so a rule added after
    /// [`power_monitor`](Self::power_monitor) overrides its scripted answer.
    pub fn reply(mut self, prefix: &str, bytes: &[u8]) -> Self {
        self.rules.push((prefix.to_string(), bytes.to_vec()));
        self
    }

    /// Answer `prefix` with the standard acknowledgement `ack <prefix> <extra>`.
    pub fn ack(self, prefix: &str, extra: &str) -> Self {
        let text = if extra.is_empty() {
            format!("ack {}\r\n\r\n", prefix)
        } else {
            format!("ack {} {}\r\n\r\n", prefix, extra)
        };
        self.reply(prefix, text.as_bytes())
    }

    /// Make every write fail as if the port had been unplugged.
    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    /// Handle for inspecting the transport after it has been moved.
    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

impl Transport for MockTransport {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, bytes: &[u8]) -> AppResult<()> {
        if self.fail_writes {
            return Err(DaqError::Communication(format!(
                "write to '{}' failed: device disconnected",
                self.name
            )));
        }
        let line = String::from_utf8_lossy(bytes).trim_end().to_string();
        let reply = self
            .rules
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone());

        let mut state = self.handle.lock();
        state.written.push(line);
        if let Some(reply) = reply {
            state.rx.extend(reply);
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        let mut state = self.handle.lock();
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn bytes_available(&mut self) -> AppResult<usize> {
        Ok(self.handle.lock().rx.len())
    }

    fn clear(&mut self) -> AppResult<()> {
        let mut state = self.handle.lock();
        state.rx.clear();
        state.clears += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_reply_is_queued_on_write() {
        let mut port = MockTransport::new("mock0").ack("power_monitor", "");
        let handle = port.handle();
        port.write_all(b"power_monitor\r\n").unwrap();

        let mut buf = [0u8; 64];
        let n = port.read_available(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ack power_monitor\r\n\r\n");
        assert_eq!(handle.written(), vec!["power_monitor".to_string()]);
    }

    #[test]
    fn test_later_rule_overrides_preset() {
        let mut port =
            MockTransport::power_monitor("mock0").reply("pwr on", b"ack pwr off\r\n\r\n");
        port.write_all(b"pwr on\r\n").unwrap();

        let mut buf = [0u8; 64];
        let n = port.read_available(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ack pwr off\r\n\r\n");
    }

    #[test]
    fn test_unknown_command_gets_no_reply() {
        let mut port = MockTransport::new("mock0");
        port.write_all(b"bogus\r\n").unwrap();
        assert_eq!(port.bytes_available().unwrap(), 0);
    }

    #[test]
    fn test_clear_discards_input() {
        let mut port = MockTransport::new("mock0");
        let handle = port.handle();
        handle.push_input(b"stale");
        port.clear().unwrap();
        assert_eq!(port.bytes_available().unwrap(), 0);
        assert_eq!(handle.clears(), 1);
    }
}
