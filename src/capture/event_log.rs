//! Target-side event log read from a COM port.
//!
//! The firmware under test prints one record per state change:
//!
//! ```text
//! [SLP_SOL]INIT:1250:us:DIVENR=1:MISCENR=2[SLP_EOL]
//! [SLP_SOL]END_OF_LOG[SLP_EOL]
//! ```
//!
//! Fields are colon separated: label, integer timestamp, its unit (`ns`, `us`
//! or `ms`), then optional `register=value` fields. An empty timestamp reads
//! as zero. The literal `END_OF_LOG` closes the log.

use super::device::{CaptureData, CaptureDevice, CapturePlan};
use crate::adapters::Transport;
use crate::error::{AppResult, DaqError};
use crate::logging::Reporter;
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

/// Opening marker of a record.
pub const RECORD_START: &str = "[SLP_SOL]";
/// Closing marker of a record.
pub const RECORD_END: &str = "[SLP_EOL]";
/// Token ending the log.
pub const END_OF_LOG: &str = "END_OF_LOG";

/// Default baud rate of the log channel.
pub const DEFAULT_LOG_BAUD: u32 = 115_200;
/// Default time without data after which the log is considered finished.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// One logged event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// State or sequence label.
    pub label: String,
    /// Time since the start of the log, seconds.
    pub timestamp_s: f64,
    /// Register snapshot attached to the event.
    pub registers: BTreeMap<String, String>,
}

/// Convert an integer timestamp and its unit to seconds.
pub fn parse_timestamp(value: &str, unit: &str) -> Option<f64> {
    let per_second = match unit.trim() {
        "ns" => 1e9,
        "us" => 1e6,
        "ms" => 1e3,
        _ => return None,
    };
    let value = value.trim();
    if value.is_empty() {
        return Some(0.0);
    }
    value.parse::<u64>().ok().map(|v| v as f64 / per_second)
}

/// Parse the text between the record markers.
pub fn parse_record(payload: &str) -> Option<EventRecord> {
    let mut fields = payload.split(':').map(str::trim);
    let label = fields.next().filter(|l| !l.is_empty())?.to_string();
    let timestamp_s = parse_timestamp(fields.next()?, fields.next()?)?;

    let mut registers = BTreeMap::new();
    for (index, field) in fields.enumerate() {
        let (name, value) = match field.split_once('=') {
            Some((name, value)) => (name.trim().to_string(), value.trim()),
            None => (format!("reg{}", index), field),
        };
        registers.insert(name, value.to_string());
    }

    Some(EventRecord {
        label,
        timestamp_s,
        registers,
    })
}

/// Parsed log content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLog {
    /// Records in log order.
    pub records: Vec<EventRecord>,
    /// `END_OF_LOG` was seen.
    pub complete: bool,
    /// Records between markers that could not be parsed.
    pub malformed: Vec<String>,
}

/// Extract every record of `text` up to `END_OF_LOG`. Text outside markers is ignored.
pub fn parse_log(text: &str) -> ParsedLog {
    let (body, complete) = match text.find(END_OF_LOG) {
        Some(end) => (&text[..end], true),
        None => (text, false),
    };

    let mut parsed = ParsedLog {
        complete,
        ..ParsedLog::default()
    };
    let mut rest = body;
    while let Some(start) = rest.find(RECORD_START) {
        let after = &rest[start + RECORD_START.len()..];
        let Some(end) = after.find(RECORD_END) else {
            break;
        };
        let payload = &after[..end];
        match parse_record(payload) {
            Some(record) => parsed.records.push(record),
            None => parsed.malformed.push(payload.to_string()),
        }
        rest = &after[end + RECORD_END.len()..];
    }
    parsed
}

/// Read the log from `transport` until `END_OF_LOG` or `idle_timeout` without data.
pub fn read_log<T: Transport>(
    transport: &mut T,
    idle_timeout: Duration,
    reporter: &Reporter,
) -> AppResult<Vec<EventRecord>> {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 1024];
    let mut last_data = Instant::now();

    loop {
        let n = transport.read_available(&mut chunk)?;
        if n > 0 {
            raw.extend_from_slice(&chunk[..n]);
            last_data = Instant::now();
            if contains(&raw, END_OF_LOG.as_bytes()) {
                break;
            }
        } else if last_data.elapsed() > idle_timeout {
            break;
        } else {
            thread::sleep(POLL_INTERVAL);
        }
    }

    let text = String::from_utf8_lossy(&raw);
    let parsed = parse_log(&text);
    for payload in &parsed.malformed {
        reporter.warn(format_args!(
            "[{}] Skipping malformed log record {:?}",
            transport.port_name(),
            payload
        ));
    }
    if !parsed.complete {
        if parsed.records.is_empty() {
            return Err(DaqError::Timeout {
                waiting_for: format!("event log on '{}'", transport.port_name()),
                timeout: idle_timeout,
            });
        }
        reporter.warn(format_args!(
            "[{}] Log ended without {} after {:?} idle, keeping {} records",
            transport.port_name(),
            END_OF_LOG,
            idle_timeout,
            parsed.records.len()
        ));
    }
    reporter.info(format_args!(
        "[{}] {} events logged",
        transport.port_name(),
        parsed.records.len()
    ));
    Ok(parsed.records)
}

/// Capture device recording the target's event log.
///
/// It has no supply of its own, so power control is a no-op.
pub struct EventLogger<T: Transport> {
    name: String,
    transport: T,
    idle_timeout: Duration,
    events: Option<Vec<EventRecord>>,
    reporter: Reporter,
}

impl<T: Transport> EventLogger<T> {
    #[allow(missing_docs)]
    pub fn new(name: impl Into<String>, transport: T, reporter: Reporter) -> Self {
        Self {
            name: name.into(),
            transport,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            events: None,
            reporter,
        }
    }

    #[allow(missing_docs)]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

impl<T: Transport> CaptureDevice for EventLogger<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, _plan: &CapturePlan) -> AppResult<()> {
        // drop boot output so the log starts with this run
        self.transport.clear()?;
        self.events = None;
        Ok(())
    }

    fn power_on(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn power_off(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn capture(&mut self) -> AppResult<()> {
        let records = read_log(&mut self.transport, self.idle_timeout, &self.reporter)?;
        self.events = Some(records);
        Ok(())
    }

    fn take_data(&mut self) -> CaptureData {
        self.events.take().map_or(CaptureData::Empty, CaptureData::Events)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
