//! Command-line front end.
//!
//! # Usage
//!
//! ```bash
//! # Capture with the devices of a settings file
//! rail_daq capture --config bench.toml
//!
//! # Write the CSV files somewhere else
//! rail_daq capture --config bench.toml --output /tmp/captures
//!
//! # Switch every configured rail on, then off again
//! rail_daq power --config bench.toml on
//! rail_daq power --config bench.toml off
//!
//! # List serial ports, marking power monitors
//! rail_daq list
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use rail_daq::capture::{CaptureDevice, CaptureOrchestrator, Dataset, POWER_SETTLE};
use rail_daq::config::{DeviceKind, Settings};
use rail_daq::logging::Reporter;
use rail_daq::storage::{CaptureMetadata, CsvWriter};
use std::path::{Path, PathBuf};

/// Synchronised power capture across several measurement instruments
#[derive(Parser, Debug)]
#[command(name = "rail_daq")]
#[command(version)]
#[command(about = "Synchronised power capture across several rails", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging regardless of the configured level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one capture and write it as CSV
    Capture {
        /// Settings file (TOML or YAML)
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Output directory, overrides `application.output_dir`
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },
    /// Switch the configured rails on or off in sequencing order
    Power {
        /// Settings file (TOML or YAML)
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Target state of the supplies
        #[arg(value_enum)]
        state: PowerState,
    },
    /// List the serial ports of this machine
    List,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum PowerState {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Capture { config, output } => {
            let (settings, level) = load_settings(&config, cli.verbose)?;
            capture(settings, output, Reporter::new("rail_daq", level)).await
        }
        Command::Power { config, state } => {
            let (settings, level) = load_settings(&config, cli.verbose)?;
            power(settings, state, Reporter::new("rail_daq", level)).await
        }
        Command::List => {
            init_logging(if cli.verbose {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            });
            list_ports()
        }
    }
}

fn load_settings(config: &Path, verbose: bool) -> Result<(Settings, LevelFilter)> {
    let settings = Settings::load_from(config)
        .with_context(|| format!("Failed to load settings from {:?}", config))?;
    let level = if verbose {
        LevelFilter::Debug
    } else {
        settings.log_level()?
    };
    init_logging(level);
    Ok((settings, level))
}

/// Open the enabled devices on the blocking pool. Fails when no rail answered.
async fn connect_rails(
    settings: &Settings,
    reporter: &Reporter,
    rails_only: bool,
) -> Result<CaptureOrchestrator> {
    let blocking_settings = settings.clone();
    let blocking_reporter = reporter.clone();
    let devices = tokio::task::spawn_blocking(move || connect(&blocking_settings, &blocking_reporter))
        .await
        .context("Device connection task failed")??;

    let rails: Vec<&str> = settings
        .enabled_devices()
        .filter(|d| d.r#type == DeviceKind::Rail)
        .map(|d| d.name.as_str())
        .collect();
    if !devices.iter().any(|d| rails.contains(&d.name())) {
        bail!("No rail instrument could be connected");
    }

    let mut orchestrator = CaptureOrchestrator::new(reporter.scoped("capture"));
    for device in devices {
        if rails_only && !rails.contains(&device.name()) {
            continue;
        }
        orchestrator.add_device(device)?;
    }
    Ok(orchestrator)
}

async fn power(settings: Settings, state: PowerState, reporter: Reporter) -> Result<()> {
    let mut orchestrator = connect_rails(&settings, &reporter, true).await?;
    match state {
        PowerState::On => orchestrator.power_up(POWER_SETTLE).await?,
        PowerState::Off => orchestrator.power_down().await?,
    }
    println!(
        "Power {} on {}",
        if state == PowerState::On { "on" } else { "off" },
        orchestrator.device_names().join(", ")
    );
    Ok(())
}

async fn capture(settings: Settings, output: Option<PathBuf>, reporter: Reporter) -> Result<()> {
    let plan = settings.plan()?;
    let started = chrono::Utc::now();

    let mut orchestrator = connect_rails(&settings, &reporter, false).await?;

    let dataset = orchestrator
        .run(&plan)
        .await
        .context("Capture failed")?;
    print_summaries(&dataset);

    let metadata = CaptureMetadata {
        application: settings.application.name.clone(),
        started,
        rate_hz: plan.rate.hz(),
        duration_us: settings.capture.duration_us,
        devices: orchestrator.device_names(),
        board_temperatures_c: dataset.board_temperatures(),
    };
    let output_dir = output.unwrap_or_else(|| settings.application.output_dir.clone());
    let files = CsvWriter::new(output_dir)
        .write(&dataset, &metadata)
        .context("Failed to write CSV output")?;
    println!("Samples: {}", files.samples.display());
    println!("States:  {}", files.states.display());
    Ok(())
}

#[cfg(feature = "instrument_serial")]
fn connect(settings: &Settings, reporter: &Reporter) -> Result<Vec<Box<dyn CaptureDevice>>> {
    let definitions: Vec<_> = settings.enabled_devices().cloned().collect();
    Ok(rail_daq::capture::connect_devices(
        &definitions,
        |definition| rail_daq::capture::open_serial_device(definition, settings, reporter),
        reporter,
    ))
}

#[cfg(not(feature = "instrument_serial"))]
fn connect(_settings: &Settings, _reporter: &Reporter) -> Result<Vec<Box<dyn CaptureDevice>>> {
    Err(rail_daq::error::DaqError::FeatureNotEnabled("instrument_serial".to_string()).into())
}

#[cfg(feature = "instrument_serial")]
fn list_ports() -> Result<()> {
    let ports = rail_daq::adapters::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    let monitors = ports.iter().filter(|p| p.is_power_monitor).count();
    println!("Detected {} power monitor(s) among {} port(s)", monitors, ports.len());
    for port in ports {
        println!(
            "  {} {} {}",
            port.name,
            port.serial_number.as_deref().unwrap_or("-"),
            if port.is_power_monitor { "(STLink PWR)" } else { "" }
        );
    }
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
fn list_ports() -> Result<()> {
    Err(rail_daq::error::DaqError::FeatureNotEnabled("instrument_serial".to_string()).into())
}

fn print_summaries(dataset: &Dataset) {
    println!(
        "{} samples at {} ({} rails)",
        dataset.len(),
        dataset.rate,
        dataset.rails.len()
    );
    for summary in dataset.state_summaries() {
        println!(
            "{:<20} {:>8} samples {:>10.4} s",
            summary.label, summary.samples, summary.duration_s
        );
        for ((rail, watts), (_, joules)) in summary.mean_power_w.iter().zip(&summary.energy_j) {
            println!("    {:<16} {:>12.6e} W {:>12.6e} J", rail, watts, joules);
        }
    }
}

fn init_logging(level: LevelFilter) {
    // RUST_LOG wins over the configured level
    env_logger::Builder::new()
        .filter_module("rail_daq", level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}
