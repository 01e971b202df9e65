//! Common interface of everything the orchestrator drives.

use super::event_log::EventRecord;
use crate::error::{AppResult, DaqError};
use crate::instrument::{AcquisitionTime, SampleStatistics, SamplingRate};

/// Sampling rate and length shared by every device of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePlan {
    #[allow(missing_docs)]
    pub rate: SamplingRate,
    /// Always finite.
    pub duration: AcquisitionTime,
}

impl CapturePlan {
    /// Plan of `duration_us` microseconds at `rate`.
    pub fn new(rate: SamplingRate, duration_us: u64) -> AppResult<Self> {
        Ok(Self {
            rate,
            duration: AcquisitionTime::from_micros(duration_us)?,
        })
    }

    /// Number of grid ticks covered by the plan.
    pub fn samples(&self) -> usize {
        match self.duration {
            AcquisitionTime::Micros(us) => {
                (u128::from(self.rate.hz()) * u128::from(us) / 1_000_000) as usize
            }
            AcquisitionTime::Infinite => 0,
        }
    }
}

/// Power trace of one rail.
#[derive(Debug, Clone, PartialEq)]
pub struct RailTrace {
    /// Rail name, also the column prefix.
    pub name: String,
    /// Rail voltage, volts.
    pub voltage_v: f64,
    /// Conversion efficiency between supply and rail.
    pub efficiency: f64,
    /// Measured currents, amperes.
    pub currents_a: Vec<f64>,
    /// Statistics of the raw currents.
    pub statistics: Option<SampleStatistics>,
    /// Instrument board temperature read after the acquisition, °C.
    pub board_temperature_c: Option<f64>,
}

impl RailTrace {
    /// Power per sample: `amps × rail_voltage × efficiency`.
    pub fn watts(&self) -> Vec<f64> {
        self.currents_a
            .iter()
            .map(|a| power_watts(*a, self.voltage_v, self.efficiency))
            .collect()
    }
}

/// Convert a current to power on a rail.
pub fn power_watts(amps: f64, rail_voltage: f64, efficiency: f64) -> f64 {
    amps * rail_voltage * efficiency
}

/// What a device produced during its capture.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureData {
    /// Current samples of a power rail.
    Rail(RailTrace),
    /// Events of a target log.
    Events(Vec<EventRecord>),
    /// The device has not captured yet.
    Empty,
}

/// A device taking part in a synchronised capture.
///
/// The orchestrator calls `setup`, `power_on` and `power_off` on the runtime
/// thread and `capture` on a blocking worker, so implementations own their
/// transport and hold no shared state.
pub trait CaptureDevice: Send {
    /// Unique name, used for power sequencing and column headers.
    fn name(&self) -> &str;

    /// Apply the capture plan. Must not start streaming.
    fn setup(&mut self, plan: &CapturePlan) -> AppResult<()>;

    #[allow(missing_docs)]
    fn power_on(&mut self) -> AppResult<()>;

    #[allow(missing_docs)]
    fn power_off(&mut self) -> AppResult<()>;

    /// Start the capture and block until it is complete.
    fn capture(&mut self) -> AppResult<()>;

    /// Hand over the captured data, leaving [`CaptureData::Empty`] behind.
    fn take_data(&mut self) -> CaptureData;
}

pub(crate) fn not_set_up(device: &str) -> DaqError {
    DaqError::configuration(
        "capture_plan",
        format!("'{}' was asked to capture before setup", device),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_sample_count() {
        let plan = CapturePlan::new(SamplingRate::new(1_000).unwrap(), 2_500_000).unwrap();
        assert_eq!(plan.samples(), 2_500);
        assert!(CapturePlan::new(SamplingRate::new(1_000).unwrap(), 10).is_err());
    }

    #[test]
    fn test_power_conversion() {
        let trace = RailTrace {
            name: "VDDCORE".into(),
            voltage_v: 1.2,
            efficiency: 0.5,
            currents_a: vec![0.0, 0.01, 0.1],
            statistics: None,
            board_temperature_c: None,
        };
        let watts = trace.watts();
        assert_eq!(watts[0], 0.0);
        assert!((watts[1] - 0.006).abs() < 1e-12);
        assert!((watts[2] - 0.06).abs() < 1e-12);
    }
}
