//! Synchronised capture across several devices.
//!
//! A run sets every device up, powers the rails on in sequencing order, starts
//! one blocking worker per device in that same order and joins them in that
//! order. Rails are powered off in reverse before any data is aggregated.
//! Device I/O never runs on the async executor: setup and power switching
//! run on Tokio's blocking pool like the capture workers.

use super::dataset::Dataset;
use super::device::{CaptureData, CaptureDevice, CapturePlan};
use super::sequence::{power_off_order, power_on_order};
use crate::error::{AppResult, DaqError};
use crate::logging::Reporter;
use std::thread;
use std::time::Duration;
use tokio::task;

type Device = Box<dyn CaptureDevice>;
type Slot = Option<Device>;

/// Pause between two rails switched on by [`CaptureOrchestrator::power_up`].
pub const POWER_SETTLE: Duration = Duration::from_millis(100);

/// Owner of the devices taking part in a capture.
pub struct CaptureOrchestrator {
    devices: Vec<Device>,
    reporter: Reporter,
}

impl CaptureOrchestrator {
    #[allow(missing_docs)]
    pub fn new(reporter: Reporter) -> Self {
        Self {
            devices: Vec::new(),
            reporter,
        }
    }

    /// Add a device. Names must be unique.
    pub fn add_device(&mut self, device: Device) -> AppResult<()> {
        if self.devices.iter().any(|d| d.name() == device.name()) {
            return Err(DaqError::configuration(
                "devices",
                format!("duplicate device name '{}'", device.name()),
            ));
        }
        self.devices.push(device);
        Ok(())
    }

    /// Device names in the order they were added.
    pub fn device_names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name().to_string()).collect()
    }

    /// Run one capture and return the assembled dataset.
    ///
    /// The first failing setup or power-on aborts the run. Rails already powered
    /// are switched off again before returning. A failing capture worker fails the
    /// run after every worker has been joined and every rail powered off.
    pub async fn run(&mut self, plan: &CapturePlan) -> AppResult<Dataset> {
        if self.devices.is_empty() {
            return Err(DaqError::configuration("devices", "no device to capture from"));
        }
        let names = self.device_names();
        let order = power_on_order(&names);
        let off_order = power_off_order(&names);
        self.reporter.info(format_args!(
            "Capture of {} samples at {} on {:?}",
            plan.samples(),
            plan.rate,
            order.iter().map(|&i| names[i].as_str()).collect::<Vec<_>>()
        ));

        let plan = *plan;
        let reporter = self.reporter.clone();
        let sequence = order.clone();
        self.with_devices(move |devices| {
            setup_all(devices, &plan, &reporter)?;
            switch_on(devices, &sequence, Duration::ZERO, &reporter)
        })
        .await?;

        let mut slots: Vec<Slot> = self.devices.drain(..).map(Some).collect();
        let first_error = self.capture_all(&mut slots, &order).await;

        // a device whose worker panicked is gone and cannot be powered off
        let reporter = self.reporter.clone();
        let (mut slots, outcome) =
            on_blocking_pool(slots, move |slots| switch_off_slots(slots, &off_order, &reporter))
                .await?;
        let data: Vec<CaptureData> = slots
            .iter_mut()
            .flatten()
            .map(|device| device.take_data())
            .collect();
        self.devices = slots.into_iter().flatten().collect();

        if let Some(e) = first_error {
            return Err(e);
        }
        outcome?;
        Ok(Dataset::assemble(plan.rate, data, &self.reporter))
    }

    /// Switch every device on in sequencing order, pausing `settle` after each.
    ///
    /// A failure switches the devices already on off again.
    pub async fn power_up(&mut self, settle: Duration) -> AppResult<()> {
        let order = power_on_order(&self.device_names());
        let reporter = self.reporter.clone();
        self.with_devices(move |devices| switch_on(devices, &order, settle, &reporter))
            .await
    }

    /// Switch every device off in reverse sequencing order.
    ///
    /// Every device is attempted; the first failure is returned.
    pub async fn power_down(&mut self) -> AppResult<()> {
        let order = power_off_order(&self.device_names());
        let reporter = self.reporter.clone();
        self.with_devices(move |devices| {
            let mut slots: Vec<Slot> = devices.drain(..).map(Some).collect();
            let outcome = switch_off_slots(&mut slots, &order, &reporter);
            devices.extend(slots.into_iter().flatten());
            outcome
        })
        .await
    }

    /// Run `f` on the devices from the blocking pool.
    async fn with_devices<F>(&mut self, f: F) -> AppResult<()>
    where
        F: FnOnce(&mut Vec<Device>) -> AppResult<()> + Send + 'static,
    {
        let devices = std::mem::take(&mut self.devices);
        let (devices, outcome) = on_blocking_pool(devices, f).await?;
        self.devices = devices;
        outcome
    }

    async fn capture_all(&self, slots: &mut [Slot], order: &[usize]) -> Option<DaqError> {
        let mut workers = Vec::with_capacity(order.len());
        for &i in order {
            if let Some(mut device) = slots[i].take() {
                let name = device.name().to_string();
                let handle = task::spawn_blocking(move || {
                    let result = device.capture();
                    (device, result)
                });
                workers.push((i, name, handle));
            }
        }

        let mut first_error = None;
        for (i, name, handle) in workers {
            match handle.await {
                Ok((device, result)) => {
                    if let Err(e) = result {
                        self.reporter
                            .error(format_args!("Capture on '{}' failed: {}", name, e));
                        first_error.get_or_insert(e);
                    }
                    slots[i] = Some(device);
                }
                Err(join_error) => {
                    let err = DaqError::Worker {
                        device: name,
                        reason: join_error.to_string(),
                    };
                    self.reporter.error(format_args!("{}", err));
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error
    }
}

/// Move `value` to the blocking pool, apply `f` and hand both back.
async fn on_blocking_pool<T, R, F>(mut value: T, f: F) -> AppResult<(T, R)>
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnOnce(&mut T) -> R + Send + 'static,
{
    task::spawn_blocking(move || {
        let result = f(&mut value);
        (value, result)
    })
    .await
    .map_err(|e| DaqError::Worker {
        device: "device control".to_string(),
        reason: e.to_string(),
    })
}

fn setup_all(devices: &mut [Device], plan: &CapturePlan, reporter: &Reporter) -> AppResult<()> {
    for device in devices.iter_mut() {
        device.setup(plan).map_err(|e| {
            reporter.error(format_args!("Setup of '{}' failed: {}", device.name(), e));
            e
        })?;
    }
    Ok(())
}

fn switch_on(
    devices: &mut [Device],
    order: &[usize],
    settle: Duration,
    reporter: &Reporter,
) -> AppResult<()> {
    for (n, &i) in order.iter().enumerate() {
        if let Err(e) = devices[i].power_on() {
            reporter.error(format_args!("Power on of '{}' failed: {}", devices[i].name(), e));
            for &j in order[..n].iter().rev() {
                if let Err(e) = devices[j].power_off() {
                    reporter.warn(format_args!(
                        "Power off of '{}' failed: {}",
                        devices[j].name(),
                        e
                    ));
                }
            }
            return Err(e);
        }
        if !settle.is_zero() {
            thread::sleep(settle);
        }
    }
    Ok(())
}

fn switch_off_slots(slots: &mut [Slot], off_order: &[usize], reporter: &Reporter) -> AppResult<()> {
    let mut first_error = None;
    for &i in off_order {
        if let Some(device) = slots[i].as_mut() {
            if let Err(e) = device.power_off() {
                reporter.error(format_args!("Power off of '{}' failed: {}", device.name(), e));
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Open every definition with `open`, skipping those that fail.
///
/// A failed handshake only excludes that device; the caller decides whether the
/// remaining set is still worth capturing from.
pub fn connect_devices<D, F>(
    definitions: &[D],
    mut open: F,
    reporter: &Reporter,
) -> Vec<Box<dyn CaptureDevice>>
where
    F: FnMut(&D) -> AppResult<Box<dyn CaptureDevice>>,
{
    definitions
        .iter()
        .enumerate()
        .filter_map(|(index, definition)| match open(definition) {
            Ok(device) => {
                reporter.info(format_args!("Device '{}' connected", device.name()));
                Some(device)
            }
            Err(e) => {
                reporter.error(format_args!("Device #{} excluded: {}", index, e));
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::device::RailTrace;
    use crate::instrument::SamplingRate;
    use std::sync::{Arc, Mutex};
    use std::thread::ThreadId;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: String,
        journal: Journal,
        fail_setup: bool,
        fail_capture: bool,
        fail_power_on: bool,
        captured: bool,
        threads: Arc<Mutex<Vec<ThreadId>>>,
    }

    impl Recorder {
        fn boxed(name: &str, journal: &Journal) -> Box<dyn CaptureDevice> {
            Box::new(Self::new(name, journal))
        }

        fn new(name: &str, journal: &Journal) -> Self {
            Self {
                name: name.to_string(),
                journal: journal.clone(),
                fail_setup: false,
                fail_capture: false,
                fail_power_on: false,
                captured: false,
                threads: Arc::default(),
            }
        }

        fn note(&self, what: &str) {
            self.threads.lock().unwrap().push(thread::current().id());
            self.journal
                .lock()
                .unwrap()
                .push(format!("{} {}", what, self.name));
        }
    }

    impl CaptureDevice for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn setup(&mut self, _plan: &CapturePlan) -> AppResult<()> {
            self.note("setup");
            if self.fail_setup {
                return Err(DaqError::configuration("voltage", "rejected"));
            }
            Ok(())
        }

        fn power_on(&mut self) -> AppResult<()> {
            self.note("on");
            if self.fail_power_on {
                return Err(DaqError::Communication("no power echo".into()));
            }
            Ok(())
        }

        fn power_off(&mut self) -> AppResult<()> {
            self.note("off");
            Ok(())
        }

        fn capture(&mut self) -> AppResult<()> {
            if self.fail_capture {
                return Err(DaqError::Communication("stream lost".into()));
            }
            self.captured = true;
            Ok(())
        }

        fn take_data(&mut self) -> CaptureData {
            if !self.captured {
                return CaptureData::Empty;
            }
            self.captured = false;
            CaptureData::Rail(RailTrace {
                name: self.name.clone(),
                voltage_v: 1.0,
                efficiency: 1.0,
                currents_a: vec![0.1; 4],
                statistics: None,
                board_temperature_c: None,
            })
        }
    }

    fn plan() -> CapturePlan {
        CapturePlan::new(SamplingRate::new(10).unwrap(), 400_000).unwrap()
    }

    fn entries(journal: &Journal, prefix: &str) -> Vec<String> {
        journal
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_power_sequencing_around_capture() {
        let journal = Journal::default();
        let mut orchestrator = CaptureOrchestrator::new(Reporter::silent());
        for name in ["VDDCORE", "VDDA1V8", "VDDIO"] {
            orchestrator.add_device(Recorder::boxed(name, &journal)).unwrap();
        }

        let dataset = orchestrator.run(&plan()).await.unwrap();

        assert_eq!(entries(&journal, "on "), vec!["VDDIO", "VDDA1V8", "VDDCORE"]);
        assert_eq!(entries(&journal, "off "), vec!["VDDCORE", "VDDA1V8", "VDDIO"]);
        let rails: Vec<_> = dataset.rails.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(rails, vec!["VDDCORE", "VDDA1V8", "VDDIO"]);
        assert_eq!(dataset.len(), 4);
        assert_eq!(orchestrator.device_names().len(), 3);
    }

    #[tokio::test]
    async fn test_setup_failure_aborts_before_power() {
        let journal = Journal::default();
        let mut orchestrator = CaptureOrchestrator::new(Reporter::silent());
        orchestrator.add_device(Recorder::boxed("VDDIO", &journal)).unwrap();
        let mut bad = Recorder::new("VDDCORE", &journal);
        bad.fail_setup = true;
        orchestrator.add_device(Box::new(bad)).unwrap();

        let err = orchestrator.run(&plan()).await.unwrap_err();
        assert!(matches!(err, DaqError::Configuration { field: "voltage", .. }));
        assert!(entries(&journal, "on ").is_empty());
    }

    #[tokio::test]
    async fn test_capture_failure_still_powers_off() {
        let journal = Journal::default();
        let mut orchestrator = CaptureOrchestrator::new(Reporter::silent());
        let mut bad = Recorder::new("VDDIO", &journal);
        bad.fail_capture = true;
        orchestrator.add_device(Box::new(bad)).unwrap();
        orchestrator.add_device(Recorder::boxed("VDDCORE", &journal)).unwrap();

        let err = orchestrator.run(&plan()).await.unwrap_err();
        assert!(matches!(err, DaqError::Communication(_)));
        assert_eq!(entries(&journal, "off "), vec!["VDDCORE", "VDDIO"]);
        assert_eq!(orchestrator.device_names(), vec!["VDDIO", "VDDCORE"]);
    }

    #[tokio::test]
    async fn test_empty_and_duplicate_devices() {
        let journal = Journal::default();
        let mut orchestrator = CaptureOrchestrator::new(Reporter::silent());
        assert!(orchestrator.run(&plan()).await.is_err());
        orchestrator.add_device(Recorder::boxed("VDDIO", &journal)).unwrap();
        assert!(orchestrator.add_device(Recorder::boxed("VDDIO", &journal)).is_err());
    }

    #[test]
    fn test_connect_excludes_failed_devices() {
        let journal = Journal::default();
        let names = ["VDDIO", "broken", "VDDCORE"];
        let devices = connect_devices(
            &names,
            |name| {
                if *name == "broken" {
                    Err(DaqError::configuration("identification", "no ack"))
                } else {
                    Ok(Recorder::boxed(name, &journal))
                }
            },
            &Reporter::silent(),
        );
        let connected: Vec<_> = devices.iter().map(|d| d.name().to_string()).collect();
        assert_eq!(connected, vec!["VDDIO", "VDDCORE"]);
    }

    #[tokio::test]
    async fn test_device_control_runs_off_the_executor() {
        let journal = Journal::default();
        let device = Recorder::new("VDDIO", &journal);
        let threads = device.threads.clone();
        let mut orchestrator = CaptureOrchestrator::new(Reporter::silent());
        orchestrator.add_device(Box::new(device)).unwrap();

        orchestrator.run(&plan()).await.unwrap();
        orchestrator.power_up(Duration::ZERO).await.unwrap();
        orchestrator.power_down().await.unwrap();

        let executor = thread::current().id();
        let threads = threads.lock().unwrap();
        // setup, on, off during the run, then on and off again
        assert_eq!(threads.len(), 5);
        assert!(threads.iter().all(|&id| id != executor));
    }

    #[tokio::test]
    async fn test_power_up_and_down_follow_sequencing() {
        let journal = Journal::default();
        let mut orchestrator = CaptureOrchestrator::new(Reporter::silent());
        for name in ["VDDCORE", "VDDIO", "VDDA1V8"] {
            orchestrator.add_device(Recorder::boxed(name, &journal)).unwrap();
        }

        orchestrator.power_up(Duration::from_millis(1)).await.unwrap();
        assert_eq!(entries(&journal, "on "), vec!["VDDIO", "VDDA1V8", "VDDCORE"]);
        assert!(entries(&journal, "setup ").is_empty());

        orchestrator.power_down().await.unwrap();
        assert_eq!(entries(&journal, "off "), vec!["VDDCORE", "VDDA1V8", "VDDIO"]);
        assert_eq!(orchestrator.device_names(), vec!["VDDCORE", "VDDIO", "VDDA1V8"]);
    }

    #[tokio::test]
    async fn test_failed_power_up_switches_back_off() {
        let journal = Journal::default();
        let mut orchestrator = CaptureOrchestrator::new(Reporter::silent());
        orchestrator.add_device(Recorder::boxed("VDDIO", &journal)).unwrap();
        let mut bad = Recorder::new("VDDCORE", &journal);
        bad.fail_power_on = true;
        orchestrator.add_device(Box::new(bad)).unwrap();

        let err = orchestrator.power_up(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, DaqError::Communication(_)));
        assert_eq!(entries(&journal, "off "), vec!["VDDIO"]);
        assert_eq!(orchestrator.device_names().len(), 2);
    }
}
