//! Capture devices on real serial ports.

use super::device::CaptureDevice;
use super::event_log::EventLogger;
use super::rail::RailSampler;
use crate::adapters::SerialAdapter;
use crate::config::{DeviceDefinition, DeviceKind, Settings};
use crate::error::AppResult;
use crate::instrument::{DeviceSession, TransactionChannel};
use crate::logging::Reporter;

/// Open the port of `definition` and, for rails, identify the instrument.
pub fn open_serial_device(
    definition: &DeviceDefinition,
    settings: &Settings,
    reporter: &Reporter,
) -> AppResult<Box<dyn CaptureDevice>> {
    let port = SerialAdapter::open(&definition.port, definition.baud())?;
    let scoped = reporter.scoped(&definition.name);

    match definition.r#type {
        DeviceKind::Rail => {
            let channel = TransactionChannel::new(port, scoped.clone())
                .with_timeout(settings.reply_timeout());
            let mut session = DeviceSession::open_with_channel(channel, scoped.clone())?;
            if let Some(deadline) = settings.acquisition_deadline() {
                session = session.with_acquisition_deadline(deadline);
            }
            Ok(Box::new(RailSampler::new(
                definition.name.clone(),
                session,
                definition.supply_mv,
                definition.rail_voltage,
                definition.efficiency,
                scoped,
            )
            .with_trigger(settings.capture.trigger, settings.capture.trigger_delay_ms)))
        }
        DeviceKind::EventLog => Ok(Box::new(
            EventLogger::new(definition.name.clone(), port, scoped)
                .with_idle_timeout(settings.log_idle_timeout()),
        )),
    }
}
