//! Power rail measured by one instrument.

use super::device::{not_set_up, CaptureData, CaptureDevice, CapturePlan, RailTrace};
use crate::adapters::Transport;
use crate::error::AppResult;
use crate::instrument::{DeviceSession, OutputFormat, TemperatureScale, TriggerSource};
use crate::logging::Reporter;

/// Capture device backed by a [`DeviceSession`].
pub struct RailSampler<T: Transport> {
    name: String,
    supply_mv: u32,
    rail_voltage: f64,
    efficiency: f64,
    trigger: TriggerSource,
    trigger_delay_ms: u32,
    session: DeviceSession<T>,
    plan: Option<CapturePlan>,
    trace: Option<RailTrace>,
    reporter: Reporter,
}

impl<T: Transport> RailSampler<T> {
    /// Wrap an identified session.
    ///
    /// `supply_mv` is applied to the instrument output, `rail_voltage` and
    /// `efficiency` only convert the measured current to power.
    pub fn new(
        name: impl Into<String>,
        session: DeviceSession<T>,
        supply_mv: u32,
        rail_voltage: f64,
        efficiency: f64,
        reporter: Reporter,
    ) -> Self {
        Self {
            name: name.into(),
            supply_mv,
            rail_voltage,
            efficiency,
            trigger: TriggerSource::Hardware,
            trigger_delay_ms: 0,
            session,
            plan: None,
            trace: None,
            reporter,
        }
    }

    /// Trigger applied at setup, hardware with no delay by default.
    pub fn with_trigger(mut self, source: TriggerSource, delay_ms: u32) -> Self {
        self.trigger = source;
        self.trigger_delay_ms = delay_ms;
        self
    }

    #[allow(missing_docs)]
    pub fn session(&self) -> &DeviceSession<T> {
        &self.session
    }

    /// Release the session and its transport.
    pub fn into_session(self) -> DeviceSession<T> {
        self.session
    }
}

impl<T: Transport> CaptureDevice for RailSampler<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, plan: &CapturePlan) -> AppResult<()> {
        self.session
            .setup(self.supply_mv, OutputFormat::Binary, plan.duration)?;
        self.session.init_acquisition(plan.rate)?;
        self.session.set_trigger(self.trigger, self.trigger_delay_ms)?;
        self.plan = Some(*plan);
        self.trace = None;
        Ok(())
    }

    fn power_on(&mut self) -> AppResult<()> {
        // the output voltage is programmed again right before switching on
        self.session.set_voltage(self.supply_mv)?;
        self.session.enable_power()
    }

    fn power_off(&mut self) -> AppResult<()> {
        self.session.disable_power()
    }

    fn capture(&mut self) -> AppResult<()> {
        let plan = self.plan.ok_or_else(|| not_set_up(&self.name))?;
        let acquisition = self.session.acquire(plan.samples())?;
        if let Some(stats) = &acquisition.statistics {
            self.reporter.info(format_args!(
                "[{}] {} samples, mean {:.6e} A, p2p {:.6e} A",
                self.name, stats.count, stats.mean, stats.peak_to_peak
            ));
        }
        let board_temperature_c = match self.session.temperature(TemperatureScale::Pcb) {
            Ok(t) => Some(t),
            Err(e) => {
                self.reporter
                    .warn(format_args!("[{}] Board temperature unavailable: {}", self.name, e));
                None
            }
        };
        self.trace = Some(RailTrace {
            name: self.name.clone(),
            voltage_v: self.rail_voltage,
            efficiency: self.efficiency,
            currents_a: acquisition.currents(),
            statistics: acquisition.statistics,
            board_temperature_c,
        });
        Ok(())
    }

    fn take_data(&mut self) -> CaptureData {
        self.trace.take().map_or(CaptureData::Empty, CaptureData::Rail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockHandle, MockTransport};
    use crate::error::DaqError;
    use crate::instrument::SamplingRate;

    fn instrument(stream: &[u8]) -> MockTransport {
        MockTransport::power_monitor("ps0")
            .reply("start", &[b"ack start\r\n\r\n".as_slice(), stream].concat())
    }

    fn sampler(port: MockTransport) -> (RailSampler<MockTransport>, MockHandle) {
        let handle = port.handle();
        let session = DeviceSession::open(port, Reporter::silent()).unwrap();
        (
            RailSampler::new("VDDIO", session, 3300, 1.8, 0.9, Reporter::silent()),
            handle,
        )
    }

    fn plan() -> CapturePlan {
        CapturePlan::new(SamplingRate::new(100).unwrap(), 100_000).unwrap()
    }

    /// 100 Hz for 100 ms: 10 samples plus margin, each 0x1008 = 8 / 16 = 0.5
    fn stream() -> Vec<u8> {
        std::iter::repeat([0x10u8, 0x08]).take(20).flatten().collect()
    }

    #[test]
    fn test_capture_before_setup_is_rejected() {
        let (mut rail, _) = sampler(instrument(&[]));
        assert!(matches!(rail.capture(), Err(DaqError::Configuration { .. })));
        assert_eq!(rail.take_data(), CaptureData::Empty);
    }

    #[test]
    fn test_capture_converts_to_power() {
        let (mut rail, handle) = sampler(instrument(&stream()));

        rail.setup(&plan()).unwrap();
        rail.power_on().unwrap();
        rail.capture().unwrap();
        rail.power_off().unwrap();

        let CaptureData::Rail(trace) = rail.take_data() else {
            panic!("expected a rail trace");
        };
        assert_eq!(trace.currents_a.len(), 10);
        let watts = trace.watts();
        assert!((watts[0] - 0.5 * 1.8 * 0.9).abs() < 1e-12);
        assert_eq!(trace.board_temperature_c, Some(27.25));

        let written = handle.written();
        assert!(written.iter().any(|l| l == "freq 100"));
        assert!(written.iter().any(|l| l == "acqtime 100m"));
        assert!(written.iter().any(|l| l == "temp refresh pcb"));
    }

    #[test]
    fn test_setup_arms_hardware_trigger() {
        let (mut rail, handle) = sampler(instrument(&stream()));
        rail.setup(&plan()).unwrap();

        let written = handle.written();
        let src = written.iter().position(|l| l == "trigsrc hw").unwrap();
        let delay = written.iter().position(|l| l == "trigdelay 0m").unwrap();
        let freq = written.iter().position(|l| l == "freq 100").unwrap();
        assert!(freq < src && src < delay);
        assert_eq!(rail.session().settings().trigger, Some(TriggerSource::Hardware));
    }

    #[test]
    fn test_configured_trigger_is_applied() {
        let (rail, handle) = sampler(instrument(&stream()));
        let mut rail = rail.with_trigger(TriggerSource::Software, 15);
        rail.setup(&plan()).unwrap();

        let written = handle.written();
        assert!(written.iter().any(|l| l == "trigsrc sw"));
        assert!(written.iter().any(|l| l == "trigdelay 15m"));
    }

    #[test]
    fn test_power_on_reprograms_voltage_first() {
        let (mut rail, handle) = sampler(instrument(&stream()));
        rail.setup(&plan()).unwrap();
        let before = handle.written().len();
        rail.power_on().unwrap();

        let written = handle.written();
        assert_eq!(written[before..], ["volt 3300m", "pwr on"]);
    }

    #[test]
    fn test_missing_board_temperature_keeps_trace() {
        let port = instrument(&stream()).reply("temp refresh pcb", b"error\r\n\r\n");
        let (mut rail, _) = sampler(port);
        rail.setup(&plan()).unwrap();
        rail.capture().unwrap();

        let CaptureData::Rail(trace) = rail.take_data() else {
            panic!("expected a rail trace");
        };
        assert_eq!(trace.currents_a.len(), 10);
        assert_eq!(trace.board_temperature_c, None);
    }
}
