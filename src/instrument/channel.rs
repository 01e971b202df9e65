//! Request/response transactions over a raw byte transport.
//!
//! A transaction clears both buffers, writes `"<base> <args…>\r\n"`, then reads
//! one byte at a time until the command's delimiter arrives or the read timeout
//! elapses. Reading byte-wise never consumes data past the delimiter, which
//! matters for `start`: the sample stream follows its reply immediately.

use super::command::CommandKind;
use crate::adapters::Transport;
use crate::error::{AppResult, DaqError};
use crate::logging::Reporter;
use std::thread;
use std::time::{Duration, Instant};

/// Default time allowed for a reply delimiter to arrive.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Whitespace-split reply; the acknowledgement text is removed when acknowledged.
    pub tokens: Vec<String>,
    /// The reply contained the command's acknowledgement text.
    pub acknowledged: bool,
    /// Reply text exactly as received.
    pub raw: String,
    /// The delimiter was seen before the timeout.
    pub complete: bool,
}

impl Reply {
    fn classify(kind: CommandKind, raw: String, complete: bool) -> Self {
        let ack = kind.spec().ack;
        if raw.contains(ack) {
            let tokens = raw
                .replacen(ack, "", 1)
                .split_whitespace()
                .map(str::to_string)
                .collect();
            Reply {
                tokens,
                acknowledged: true,
                raw,
                complete,
            }
        } else {
            Reply {
                tokens: raw.split_whitespace().map(str::to_string).collect(),
                acknowledged: false,
                raw,
                complete,
            }
        }
    }

    /// Turn an unacknowledged reply into an error.
    ///
    /// An incomplete reply without acknowledgement means the device never
    /// finished answering ([`DaqError::Timeout`]); a complete one means it
    /// answered something else ([`DaqError::Communication`]).
    pub fn into_result(self, kind: CommandKind, timeout: Duration) -> AppResult<Vec<String>> {
        if self.acknowledged {
            Ok(self.tokens)
        } else if !self.complete {
            Err(DaqError::Timeout {
                waiting_for: format!("reply to '{}'", kind),
                timeout,
            })
        } else {
            Err(DaqError::Communication(format!(
                "'{}' not acknowledged, device replied {:?}",
                kind,
                self.raw.trim()
            )))
        }
    }
}

/// Serialized command exchange with one instrument.
///
/// Takes `&mut self` for every transaction, so a channel cannot be used by two
/// transactions at once.
pub struct TransactionChannel<T: Transport> {
    transport: T,
    timeout: Duration,
    reporter: Reporter,
}

impl<T: Transport> TransactionChannel<T> {
    /// Wrap `transport` with the default 1 s reply timeout.
    pub fn new(transport: T, reporter: Reporter) -> Self {
        Self {
            transport,
            timeout: DEFAULT_READ_TIMEOUT,
            reporter,
        }
    }

    /// Override the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reply timeout in effect.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Name of the underlying port.
    pub fn port_name(&self) -> &str {
        self.transport.port_name()
    }

    /// Send `kind` with `args` and classify the reply.
    ///
    /// Buffers are cleared before and after the exchange.
    pub fn send(&mut self, kind: CommandKind, args: &[&str]) -> AppResult<Reply> {
        let reply = self.exchange(kind, args)?;
        self.transport.clear()?;
        Ok(reply)
    }

    /// Like [`send`](Self::send) but leaves the input buffer untouched afterwards,
    /// for commands whose reply is followed by streamed data.
    pub fn send_streaming(&mut self, kind: CommandKind, args: &[&str]) -> AppResult<Reply> {
        self.exchange(kind, args)
    }

    /// Send and require an acknowledgement; returns the reply tokens.
    pub fn request(&mut self, kind: CommandKind, args: &[&str]) -> AppResult<Vec<String>> {
        let timeout = self.timeout;
        self.send(kind, args)?.into_result(kind, timeout)
    }

    /// Direct access to the transport, used for reading the sample stream.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Release the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    fn exchange(&mut self, kind: CommandKind, args: &[&str]) -> AppResult<Reply> {
        let spec = kind.spec();
        let line = kind.render(args);

        self.transport.clear()?;
        self.transport.write_all(line.as_bytes())?;
        self.reporter.debug(format_args!(
            "[{}] Sent command: {}",
            self.transport.port_name(),
            line.trim_end()
        ));

        let (bytes, complete) = self.read_until(spec.delimiter.as_bytes())?;
        let raw = String::from_utf8_lossy(&bytes).into_owned();
        if !complete {
            self.reporter.warn(format_args!(
                "[{}] No '{}' delimiter within {:?} for '{}', got {:?}",
                self.transport.port_name(),
                spec.delimiter.escape_debug(),
                self.timeout,
                kind,
                raw
            ));
        } else {
            self.reporter.debug(format_args!(
                "[{}] Received response: {}",
                self.transport.port_name(),
                raw.trim()
            ));
        }

        Ok(Reply::classify(kind, raw, complete))
    }

    fn read_until(&mut self, delimiter: &[u8]) -> AppResult<(Vec<u8>, bool)> {
        let deadline = Instant::now() + self.timeout;
        let mut response = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            if !delimiter.is_empty() && response.ends_with(delimiter) {
                return Ok((response, true));
            }
            if Instant::now() >= deadline {
                return Ok((response, false));
            }
            if self.transport.read_available(&mut byte)? == 1 {
                response.push(byte[0]);
            } else {
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}
