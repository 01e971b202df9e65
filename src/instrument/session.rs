//! Device session: validated configuration and acquisition on one instrument.
//!
//! A session only exists after the identification handshake succeeded
//! (identity query, firmware version, power monitor mode). Every configuration
//! call validates all of its parameters before anything is sent to the device,
//! so a rejected call leaves the session exactly as it was.

use super::channel::TransactionChannel;
use super::command::CommandKind;
use super::demux::{demultiplex, FrameKind, MetadataFrame, RawSample};
use super::stats::{trim_to, SampleStatistics};
use crate::adapters::Transport;
use crate::error::{AppResult, DaqError};
use crate::logging::Reporter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

/// Accepted target supply voltage, millivolts.
pub const VOLTAGE_RANGE_MV: RangeInclusive<u32> = 1600..=3600;

/// Sampling rates the instrument accepts in numeric form.
pub const ALLOWED_RATES_HZ: [u32; 16] = [
    1, 2, 5, 10, 20, 50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 20_000, 50_000, 100_000,
];

/// Smallest `N` accepted in the `"Nk"` rate form.
pub const MIN_KILO_RATE: u32 = 1_000;

/// Accepted finite acquisition time, microseconds.
pub const ACQ_TIME_RANGE_US: RangeInclusive<u64> = 100..=100_000_000;

/// Highest rate at which the ASCII stream format is usable.
pub const ASCII_MAX_RATE_HZ: u32 = 10_000;

/// Extra samples requested from the stream on top of the wanted count.
const SAMPLE_MARGIN: usize = 10;

/// Scale applied to the acquisition time to get the read window.
const WINDOW_MARGIN: f64 = 1.1;

const POLL_INTERVAL: Duration = Duration::from_millis(1);
const READ_CHUNK: usize = 4096;

/// Validated sampling frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RateRepr", into = "u32")]
pub struct SamplingRate(u32);

impl SamplingRate {
    /// Rate from a value of the enumerated set.
    pub fn new(hz: u32) -> AppResult<Self> {
        if ALLOWED_RATES_HZ.contains(&hz) {
            Ok(Self(hz))
        } else {
            Err(DaqError::configuration(
                "frequency",
                format!("{} Hz is not one of {:?}", hz, ALLOWED_RATES_HZ),
            ))
        }
    }

    /// Rate from text: a number of the enumerated set or `"Nk"` with `N >= 1000`.
    pub fn parse(text: &str) -> AppResult<Self> {
        let text = text.trim();
        if let Some(kilo) = text.strip_suffix('k') {
            let n: u32 = kilo.parse().map_err(|_| {
                DaqError::configuration("frequency", format!("'{}' is not a number of kHz", text))
            })?;
            if n < MIN_KILO_RATE {
                return Err(DaqError::configuration(
                    "frequency",
                    format!("'{}' needs at least {}k", text, MIN_KILO_RATE),
                ));
            }
            let hz = n.checked_mul(1_000).ok_or_else(|| {
                DaqError::configuration("frequency", format!("'{}' is out of range", text))
            })?;
            return Ok(Self(hz));
        }
        let hz: u32 = text.parse().map_err(|_| {
            DaqError::configuration("frequency", format!("'{}' is not a frequency", text))
        })?;
        Self::new(hz)
    }

    #[allow(missing_docs)]
    pub fn hz(self) -> u32 {
        self.0
    }

    /// Duration of one sample in seconds.
    pub fn period_s(self) -> f64 {
        1.0 / f64::from(self.0)
    }

    /// Argument of the `freq` command.
    pub fn token(self) -> String {
        if self.0 >= 1_000 && self.0 % 1_000 == 0 {
            format!("{}k", self.0 / 1_000)
        } else {
            self.0.to_string()
        }
    }
}

impl FromStr for SamplingRate {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<SamplingRate> for u32 {
    fn from(rate: SamplingRate) -> u32 {
        rate.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RateRepr {
    Number(u32),
    Text(String),
}

impl TryFrom<RateRepr> for SamplingRate {
    type Error = DaqError;

    fn try_from(repr: RateRepr) -> Result<Self, Self::Error> {
        match repr {
            RateRepr::Number(hz) => Self::new(hz),
            RateRepr::Text(text) => Self::parse(&text),
        }
    }
}

impl fmt::Display for SamplingRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.0)
    }
}

/// Length of an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionTime {
    /// Stream until stopped.
    Infinite,
    /// Fixed length in microseconds.
    Micros(u64),
}

impl AcquisitionTime {
    /// Finite acquisition time, validated against [`ACQ_TIME_RANGE_US`].
    pub fn from_micros(us: u64) -> AppResult<Self> {
        let time = AcquisitionTime::Micros(us);
        time.validate()?;
        Ok(time)
    }

    /// `"inf"`/`"infinite"` or a number of microseconds.
    pub fn parse(text: &str) -> AppResult<Self> {
        match text.trim() {
            "inf" | "infinite" => Ok(AcquisitionTime::Infinite),
            other => {
                let us: u64 = other.parse().map_err(|_| {
                    DaqError::configuration(
                        "acquisition_time",
                        format!("'{}' is neither 'infinite' nor microseconds", other),
                    )
                })?;
                Self::from_micros(us)
            }
        }
    }

    /// Check the range of a finite time.
    pub fn validate(self) -> AppResult<()> {
        match self {
            AcquisitionTime::Infinite => Ok(()),
            AcquisitionTime::Micros(us) if ACQ_TIME_RANGE_US.contains(&us) => Ok(()),
            AcquisitionTime::Micros(us) => Err(DaqError::configuration(
                "acquisition_time",
                format!(
                    "{} us is outside [{}, {}] us",
                    us,
                    ACQ_TIME_RANGE_US.start(),
                    ACQ_TIME_RANGE_US.end()
                ),
            )),
        }
    }

    /// Argument of the `acqtime` command, in the coarsest exact unit.
    pub fn token(self) -> String {
        match self {
            AcquisitionTime::Infinite => "0".to_string(),
            AcquisitionTime::Micros(us) if us % 1_000_000 == 0 => format!("{}s", us / 1_000_000),
            AcquisitionTime::Micros(us) if us % 1_000 == 0 => format!("{}m", us / 1_000),
            AcquisitionTime::Micros(us) => format!("{}u", us),
        }
    }

    #[allow(missing_docs)]
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            AcquisitionTime::Infinite => None,
            AcquisitionTime::Micros(us) => Some(Duration::from_micros(us)),
        }
    }
}

/// Stream encoding of the samples.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Binary,
    Ascii,
}

impl OutputFormat {
    /// Argument of the `format` command.
    pub fn token(self) -> &'static str {
        match self {
            OutputFormat::Binary => "bin_hex",
            OutputFormat::Ascii => "ascii_dec",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "binary" | "bin" => Ok(OutputFormat::Binary),
            "ascii" => Ok(OutputFormat::Ascii),
            other => Err(DaqError::configuration(
                "format",
                format!("'{}' is neither 'binary' nor 'ascii'", other),
            )),
        }
    }
}

/// What starts an acquisition after `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSource {
    /// The target's wake-up line; every instrument wired to it starts together.
    #[serde(rename = "hw", alias = "hardware")]
    Hardware,
    /// Streaming starts as soon as `start` is acknowledged.
    #[serde(rename = "sw", alias = "software")]
    Software,
}

impl TriggerSource {
    /// Argument of the `trigsrc` command.
    pub fn token(self) -> &'static str {
        match self {
            TriggerSource::Hardware => "hw",
            TriggerSource::Software => "sw",
        }
    }
}

/// Temperature sensors of the instrument.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureScale {
    Celsius,
    Fahrenheit,
    /// PCB sensor, refreshed by the query.
    Pcb,
}

impl TemperatureScale {
    fn command(self) -> CommandKind {
        match self {
            TemperatureScale::Celsius => CommandKind::TemperatureCelsius,
            TemperatureScale::Fahrenheit => CommandKind::TemperatureFahrenheit,
            TemperatureScale::Pcb => CommandKind::PcbTemperature,
        }
    }
}

/// Lifecycle of a session.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Identified,
    Configured,
    Acquiring,
    Idle,
}

/// Configuration the device has acknowledged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    /// Target supply voltage, millivolts.
    pub voltage_mv: u32,
    #[allow(missing_docs)]
    pub format: OutputFormat,
    #[allow(missing_docs)]
    pub acquisition_time: AcquisitionTime,
    /// Latched by [`DeviceSession::init_acquisition`].
    pub rate: Option<SamplingRate>,
    /// `None` until a trigger source was acknowledged.
    pub trigger: Option<TriggerSource>,
    /// Trigger delay, milliseconds.
    pub trigger_delay_ms: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            voltage_mv: 3300,
            format: OutputFormat::Binary,
            acquisition_time: AcquisitionTime::Infinite,
            rate: None,
            trigger: None,
            trigger_delay_ms: 0,
        }
    }
}

/// Result of one acquisition window.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    /// Samples trimmed to the requested count.
    pub samples: Vec<RawSample>,
    /// Metadata frames in stream order.
    pub frames: Vec<MetadataFrame>,
    /// `None` when no sample arrived.
    pub statistics: Option<SampleStatistics>,
}

impl Acquisition {
    /// Sample values in amperes.
    pub fn currents(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }
}

fn validate_voltage(voltage_mv: u32) -> AppResult<()> {
    if VOLTAGE_RANGE_MV.contains(&voltage_mv) {
        Ok(())
    } else {
        Err(DaqError::configuration(
            "voltage",
            format!(
                "{} mV is outside [{}, {}] mV",
                voltage_mv,
                VOLTAGE_RANGE_MV.start(),
                VOLTAGE_RANGE_MV.end()
            ),
        ))
    }
}

fn validate_format(
    field: &'static str,
    format: OutputFormat,
    rate: Option<SamplingRate>,
) -> AppResult<()> {
    match (format, rate) {
        (OutputFormat::Ascii, Some(rate)) if rate.hz() > ASCII_MAX_RATE_HZ => {
            Err(DaqError::configuration(
                field,
                format!(
                    "ascii format requires a rate of at most {} Hz, got {}",
                    ASCII_MAX_RATE_HZ, rate
                ),
            ))
        }
        _ => Ok(()),
    }
}

/// Open session with one instrument.
pub struct DeviceSession<T: Transport> {
    channel: TransactionChannel<T>,
    identity: String,
    firmware: String,
    settings: SessionSettings,
    state: SessionState,
    acquisition_deadline: Option<Duration>,
    reporter: Reporter,
}

impl<T: Transport> DeviceSession<T> {
    /// Identify the instrument behind `transport` and take control of it.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] naming the failed handshake step.
    pub fn open(transport: T, reporter: Reporter) -> AppResult<Self> {
        Self::open_with_channel(TransactionChannel::new(transport, reporter.clone()), reporter)
    }

    /// Like [`open`](Self::open) with a pre-configured channel.
    pub fn open_with_channel(
        mut channel: TransactionChannel<T>,
        reporter: Reporter,
    ) -> AppResult<Self> {
        let port = channel.port_name().to_string();
        let mut handshake = |kind: CommandKind, step: &str| {
            channel.request(kind, &[]).map_err(|e| {
                DaqError::configuration(
                    "identification",
                    format!("{} step on '{}' failed: {}", step, port, e),
                )
            })
        };

        let identity = handshake(CommandKind::Identify, "identity")?.join(" ");
        let firmware = handshake(CommandKind::Version, "firmware version")?.join(" ");
        handshake(CommandKind::PowerMonitor, "power monitor")?;

        reporter.info(format_args!(
            "[{}] Instrument identified '{}', firmware '{}'",
            port, identity, firmware
        ));

        Ok(Self {
            channel,
            identity,
            firmware,
            settings: SessionSettings::default(),
            state: SessionState::Identified,
            acquisition_deadline: None,
            reporter,
        })
    }

    /// Fail acquisitions that have not delivered their bytes within `deadline`.
    ///
    /// Without a deadline an unresponsive instrument blocks [`acquire`](Self::acquire)
    /// forever.
    pub fn with_acquisition_deadline(mut self, deadline: Duration) -> Self {
        self.acquisition_deadline = Some(deadline);
        self
    }

    #[allow(missing_docs)]
    pub fn port_name(&self) -> &str {
        self.channel.port_name()
    }

    /// Tokens following `ack STLINK-V3PWR` in the identity reply.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Firmware version reported during the handshake.
    pub fn firmware(&self) -> &str {
        &self.firmware
    }

    #[allow(missing_docs)]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    #[allow(missing_docs)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Validate and apply voltage, stream format and acquisition time.
    ///
    /// All three are validated before the first command is sent.
    pub fn setup(
        &mut self,
        voltage_mv: u32,
        format: OutputFormat,
        acquisition_time: AcquisitionTime,
    ) -> AppResult<()> {
        validate_voltage(voltage_mv)?;
        acquisition_time.validate()?;
        validate_format("format", format, self.settings.rate)?;

        self.send_voltage(voltage_mv)?;

        self.channel.request(CommandKind::Format, &[format.token()])?;
        self.settings.format = format;

        self.channel
            .request(CommandKind::AcquisitionTime, &[&acquisition_time.token()])?;
        self.settings.acquisition_time = acquisition_time;

        self.state = SessionState::Configured;
        self.reporter.debug(format_args!(
            "[{}] Configured {} mV, {:?}, acqtime {}",
            self.port_name(),
            voltage_mv,
            format,
            acquisition_time.token()
        ));
        Ok(())
    }

    /// Reprogram the supply voltage alone, e.g. right before switching power on.
    pub fn set_voltage(&mut self, voltage_mv: u32) -> AppResult<()> {
        validate_voltage(voltage_mv)?;
        self.send_voltage(voltage_mv)
    }

    fn send_voltage(&mut self, voltage_mv: u32) -> AppResult<()> {
        self.channel
            .request(CommandKind::Voltage, &[&format!("{}m", voltage_mv)])?;
        self.settings.voltage_mv = voltage_mv;
        Ok(())
    }

    /// Select what starts the acquisition and how long after the trigger
    /// sampling begins.
    pub fn set_trigger(&mut self, source: TriggerSource, delay_ms: u32) -> AppResult<()> {
        self.channel
            .request(CommandKind::TriggerSource, &[source.token()])?;
        self.settings.trigger = Some(source);

        self.channel
            .request(CommandKind::TriggerDelay, &[&format!("{}m", delay_ms)])?;
        self.settings.trigger_delay_ms = delay_ms;
        Ok(())
    }

    /// Validate and latch the sampling frequency for the next capture.
    pub fn init_acquisition(&mut self, rate: SamplingRate) -> AppResult<()> {
        validate_format("frequency", self.settings.format, Some(rate))?;
        self.channel.request(CommandKind::Frequency, &[&rate.token()])?;
        self.settings.rate = Some(rate);
        Ok(())
    }

    /// Switch the target supply on.
    pub fn enable_power(&mut self) -> AppResult<()> {
        self.set_power(true)
    }

    /// Switch the target supply off.
    pub fn disable_power(&mut self) -> AppResult<()> {
        self.set_power(false)
    }

    fn set_power(&mut self, on: bool) -> AppResult<()> {
        let wanted = if on { "on" } else { "off" };
        let tokens = self.channel.request(CommandKind::Power, &[wanted])?;
        match tokens.first().map(String::as_str) {
            Some(echo) if echo == wanted => {
                self.reporter
                    .info(format_args!("[{}] Power {}", self.port_name(), wanted));
                Ok(())
            }
            echo => Err(DaqError::Communication(format!(
                "'{}' asked for power {} but the device reported {:?}",
                self.port_name(),
                wanted,
                echo
            ))),
        }
    }

    /// Number of samples a capture with the current settings yields.
    pub fn requested_samples(&self) -> AppResult<usize> {
        let rate = self.latched_rate()?;
        match self.settings.acquisition_time {
            AcquisitionTime::Infinite => Err(DaqError::configuration(
                "acquisition_time",
                "an infinite acquisition has no sample count",
            )),
            AcquisitionTime::Micros(us) => {
                Ok((u128::from(rate.hz()) * u128::from(us) / 1_000_000) as usize)
            }
        }
    }

    fn latched_rate(&self) -> AppResult<SamplingRate> {
        self.settings.rate.ok_or_else(|| {
            DaqError::configuration("frequency", "no sampling rate latched, call init_acquisition")
        })
    }

    /// Query one of the temperature sensors.
    pub fn temperature(&mut self, scale: TemperatureScale) -> AppResult<f64> {
        let kind = scale.command();
        let tokens = self.channel.request(kind, &[])?;
        tokens
            .first()
            .and_then(|t| t.parse::<f64>().ok())
            .ok_or_else(|| {
                DaqError::Communication(format!("no temperature in '{}' reply {:?}", kind, tokens))
            })
    }

    /// Run one acquisition and return `requested` samples.
    ///
    /// Reads `(requested + 10) × 2` bytes. The read keeps polling after the
    /// nominal window (acquisition time × 1.1) has passed; only the optional
    /// acquisition deadline bounds it.
    pub fn acquire(&mut self, requested: usize) -> AppResult<Acquisition> {
        self.latched_rate()?;
        if self.settings.format != OutputFormat::Binary {
            return Err(DaqError::configuration(
                "format",
                "only the binary stream can be demultiplexed",
            ));
        }

        let expected_bytes = (requested + SAMPLE_MARGIN) * 2;
        let window = self
            .settings
            .acquisition_time
            .as_duration()
            .map(|d| d.mul_f64(WINDOW_MARGIN));

        let timeout = self.channel.timeout();
        self.channel
            .send_streaming(CommandKind::Start, &[])?
            .into_result(CommandKind::Start, timeout)?;
        self.state = SessionState::Acquiring;

        let read = self.read_stream(expected_bytes, window);
        self.stop_stream();
        self.state = SessionState::Idle;
        let buf = read?;

        let mut demuxed = demultiplex(&buf)?;
        for frame in &demuxed.frames {
            match frame.kind() {
                FrameKind::Unknown(t) => self.reporter.warn(format_args!(
                    "[{}] Unknown metadata frame 0x{:02X} at offset {}",
                    self.port_name(),
                    t,
                    frame.offset
                )),
                FrameKind::ErrorMessage => self.reporter.warn(format_args!(
                    "[{}] Instrument reported error {:?}",
                    self.port_name(),
                    frame.text().unwrap_or_default()
                )),
                FrameKind::Message => self.reporter.debug(format_args!(
                    "[{}] Instrument message {:?}",
                    self.port_name(),
                    frame.text().unwrap_or_default()
                )),
                FrameKind::Timestamp | FrameKind::Fixed(_) => {}
            }
        }

        let discarded = trim_to(&mut demuxed.samples, requested);
        if demuxed.samples.len() < requested {
            self.reporter.warn(format_args!(
                "[{}] Only {} of {} samples captured",
                self.port_name(),
                demuxed.samples.len(),
                requested
            ));
        }
        self.reporter.debug(format_args!(
            "[{}] {} samples, {} frames, {} trailing samples discarded",
            self.port_name(),
            demuxed.samples.len(),
            demuxed.frames.len(),
            discarded
        ));

        let statistics = SampleStatistics::from_samples(&demuxed.samples);
        Ok(Acquisition {
            samples: demuxed.samples,
            frames: demuxed.frames,
            statistics,
        })
    }

    fn read_stream(&mut self, expected: usize, window: Option<Duration>) -> AppResult<Vec<u8>> {
        let started = Instant::now();
        let mut buf = Vec::with_capacity(expected);
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut window_reported = false;

        while buf.len() < expected {
            let elapsed = started.elapsed();
            if let Some(deadline) = self.acquisition_deadline {
                if elapsed > deadline {
                    return Err(DaqError::Timeout {
                        waiting_for: format!(
                            "{} stream bytes from '{}' ({} received)",
                            expected,
                            self.port_name(),
                            buf.len()
                        ),
                        timeout: deadline,
                    });
                }
            }
            if let Some(window) = window {
                if !window_reported && elapsed > window {
                    window_reported = true;
                    self.reporter.warn(format_args!(
                        "[{}] Acquisition window of {:?} elapsed with {}/{} bytes, still waiting",
                        self.port_name(),
                        window,
                        buf.len(),
                        expected
                    ));
                }
            }

            let want = (expected - buf.len()).min(READ_CHUNK);
            let n = self
                .channel
                .transport_mut()
                .read_available(&mut chunk[..want])?;
            if n == 0 {
                thread::sleep(POLL_INTERVAL);
            } else {
                buf.extend_from_slice(&chunk[..n]);
            }
        }

        Ok(buf)
    }

    fn stop_stream(&mut self) {
        match self.channel.send(CommandKind::Stop, &[]) {
            Ok(reply) if reply.acknowledged => {}
            Ok(reply) => self.reporter.debug(format_args!(
                "[{}] 'stop' not acknowledged: {:?}",
                self.port_name(),
                reply.raw
            )),
            Err(e) => self
                .reporter
                .warn(format_args!("[{}] Failed to stop stream: {}", self.port_name(), e)),
        }
    }

    /// Stop any stream and release the transport.
    pub fn close(mut self) -> T {
        if self.state == SessionState::Acquiring {
            self.stop_stream();
        }
        self.reporter
            .debug(format_args!("[{}] Session closed", self.port_name()));
        self.channel.into_inner()
    }
}
