//! Command catalog of the power-measurement instrument.
//!
//! Every command is ASCII `"<base> [args]\r\n"`. The instrument answers with a
//! reply terminated by `"\r\n\r\n"` that contains `"ack <base>"` when the command
//! was accepted, or an error text otherwise. The identity query is the
//! exception: the board answers it with its own name, `"ack STLINK-V3PWR"`.

use std::fmt;

/// Reply terminator used by every command of the instrument.
pub const DEFAULT_DELIMITER: &str = "\r\n\r\n";

/// Immutable description of one command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    /// Command text written before the arguments.
    pub base: &'static str,
    /// Substring whose presence in the reply means the command was accepted.
    pub ack: &'static str,
    /// Sequence terminating the reply.
    pub delimiter: &'static str,
}

/// Commands used by the capture tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Identity query; only a power-measurement board acknowledges it.
    Identify,
    /// Firmware version query.
    Version,
    /// Arms the host-driven power monitor mode.
    PowerMonitor,
    /// Supply voltage of the target, in millivolts (`volt 3300m`).
    Voltage,
    /// Sampling frequency (`freq 1k`).
    Frequency,
    /// Acquisition time (`acqtime 10m`, `0` for infinite).
    AcquisitionTime,
    /// Stream format (`format bin_hex` / `format ascii_dec`).
    Format,
    /// Trigger source (`trigsrc hw` / `trigsrc sw`).
    TriggerSource,
    /// Delay between trigger and first sample (`trigdelay 0m`).
    TriggerDelay,
    /// Target power switch (`pwr on` / `pwr off`).
    Power,
    /// Start streaming.
    Start,
    /// Stop streaming.
    Stop,
    /// Chip temperature in degrees Celsius.
    TemperatureCelsius,
    /// Chip temperature in degrees Fahrenheit.
    TemperatureFahrenheit,
    /// Fresh reading of the PCB temperature sensor.
    PcbTemperature,
}

const IDENTIFY: CommandSpec = spec("powershield", "ack STLINK-V3PWR");
const VERSION: CommandSpec = spec("version", "ack version");
const POWER_MONITOR: CommandSpec = spec("power_monitor", "ack power_monitor");
const VOLTAGE: CommandSpec = spec("volt", "ack volt");
const FREQUENCY: CommandSpec = spec("freq", "ack freq");
const ACQ_TIME: CommandSpec = spec("acqtime", "ack acqtime");
const FORMAT: CommandSpec = spec("format", "ack format");
const TRIGGER_SOURCE: CommandSpec = spec("trigsrc", "ack trigsrc");
const TRIGGER_DELAY: CommandSpec = spec("trigdelay", "ack trigdelay");
const POWER: CommandSpec = spec("pwr", "ack pwr");
const START: CommandSpec = spec("start", "ack start");
const STOP: CommandSpec = spec("stop", "ack stop");
const TEMP_DEGC: CommandSpec = spec("temp degc", "ack temp degc");
const TEMP_DEGF: CommandSpec = spec("temp degf", "ack temp degf");
const TEMP_PCB: CommandSpec = spec("temp refresh pcb", "ack temp refresh pcb");

const fn spec(base: &'static str, ack: &'static str) -> CommandSpec {
    CommandSpec {
        base,
        ack,
        delimiter: DEFAULT_DELIMITER,
    }
}

impl CommandKind {
    /// Every command kind in the catalog.
    pub const ALL: [CommandKind; 15] = [
        CommandKind::Identify,
        CommandKind::Version,
        CommandKind::PowerMonitor,
        CommandKind::Voltage,
        CommandKind::Frequency,
        CommandKind::AcquisitionTime,
        CommandKind::Format,
        CommandKind::TriggerSource,
        CommandKind::TriggerDelay,
        CommandKind::Power,
        CommandKind::Start,
        CommandKind::Stop,
        CommandKind::TemperatureCelsius,
        CommandKind::TemperatureFahrenheit,
        CommandKind::PcbTemperature,
    ];

    /// Catalog entry for this command.
    pub fn spec(self) -> &'static CommandSpec {
        match self {
            CommandKind::Identify => &IDENTIFY,
            CommandKind::Version => &VERSION,
            CommandKind::PowerMonitor => &POWER_MONITOR,
            CommandKind::Voltage => &VOLTAGE,
            CommandKind::Frequency => &FREQUENCY,
            CommandKind::AcquisitionTime => &ACQ_TIME,
            CommandKind::Format => &FORMAT,
            CommandKind::TriggerSource => &TRIGGER_SOURCE,
            CommandKind::TriggerDelay => &TRIGGER_DELAY,
            CommandKind::Power => &POWER,
            CommandKind::Start => &START,
            CommandKind::Stop => &STOP,
            CommandKind::TemperatureCelsius => &TEMP_DEGC,
            CommandKind::TemperatureFahrenheit => &TEMP_DEGF,
            CommandKind::PcbTemperature => &TEMP_PCB,
        }
    }

    /// Look up a command by its wire name.
    pub fn from_name(name: &str) -> Option<CommandKind> {
        Self::ALL.into_iter().find(|kind| kind.spec().base == name)
    }

    /// Render the command line written to the device.
    pub fn render(self, args: &[&str]) -> String {
        let mut line = self.spec().base.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line.push_str("\r\n");
        line
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec().base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_and_without_args() {
        assert_eq!(CommandKind::Start.render(&[]), "start\r\n");
        assert_eq!(CommandKind::Voltage.render(&["3300m"]), "volt 3300m\r\n");
        assert_eq!(CommandKind::Power.render(&["on"]), "pwr on\r\n");
    }

    #[test]
    fn test_catalog_is_consistent() {
        for kind in CommandKind::ALL {
            let spec = kind.spec();
            if kind != CommandKind::Identify {
                assert_eq!(spec.ack, format!("ack {}", spec.base));
            }
            assert_eq!(spec.delimiter, "\r\n\r\n");
            assert_eq!(CommandKind::from_name(spec.base), Some(kind));
        }
        assert_eq!(CommandKind::from_name("reboot"), None);
    }

    #[test]
    fn test_identity_is_acknowledged_by_board_name() {
        assert_eq!(CommandKind::Identify.render(&[]), "powershield\r\n");
        assert_eq!(CommandKind::Identify.spec().ack, "ack STLINK-V3PWR");
    }

    #[test]
    fn test_multi_word_commands() {
        assert_eq!(
            CommandKind::PcbTemperature.render(&[]),
            "temp refresh pcb\r\n"
        );
        assert_eq!(CommandKind::TriggerDelay.render(&["0m"]), "trigdelay 0m\r\n");
        assert_eq!(
            CommandKind::from_name("temp degf"),
            Some(CommandKind::TemperatureFahrenheit)
        );
    }
}
