//! Combined result of a capture run.

use super::aligner::{align, register_names, GridRow};
use super::device::{CaptureData, RailTrace};
use super::event_log::EventRecord;
use crate::instrument::SamplingRate;
use crate::logging::Reporter;
use std::collections::BTreeMap;

/// Label of the single state reported when no event log was captured.
pub const ALL_STATES: &str = "ALL";

/// Power column of one rail.
#[derive(Debug, Clone, PartialEq)]
pub struct RailColumn {
    #[allow(missing_docs)]
    pub name: String,
    /// Power per tick, watts.
    pub watts: Vec<f64>,
    /// Instrument board temperature, °C.
    pub board_temperature_c: Option<f64>,
}

/// Time, power and state columns on the sample grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    #[allow(missing_docs)]
    pub rate: SamplingRate,
    /// Tick times, seconds from the start of the capture.
    pub time_s: Vec<f64>,
    /// Rails in device order.
    pub rails: Vec<RailColumn>,
    /// Aligned event grid, present when an event log was captured.
    pub grid: Option<Vec<GridRow>>,
    register_names: Vec<String>,
}

/// Energy and mean power of one state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSummary {
    #[allow(missing_docs)]
    pub label: String,
    /// Ticks spent in the state.
    pub samples: usize,
    /// Time spent in the state, seconds.
    pub duration_s: f64,
    /// `(rail, watts)` in rail order.
    pub mean_power_w: Vec<(String, f64)>,
    /// `(rail, joules)` in rail order.
    pub energy_j: Vec<(String, f64)>,
}

impl Dataset {
    /// Assemble the per-device results of one run.
    ///
    /// Rails are cut to the shortest trace. The first event log is aligned onto
    /// the grid, further logs are ignored with a warning.
    pub fn assemble(rate: SamplingRate, data: Vec<CaptureData>, reporter: &Reporter) -> Self {
        let mut traces: Vec<RailTrace> = Vec::new();
        let mut events: Option<Vec<EventRecord>> = None;
        for item in data {
            match item {
                CaptureData::Rail(trace) => traces.push(trace),
                CaptureData::Events(records) if events.is_none() => events = Some(records),
                CaptureData::Events(records) => reporter.warn(format_args!(
                    "Ignoring a second event log with {} records",
                    records.len()
                )),
                CaptureData::Empty => {}
            }
        }

        let ticks = traces
            .iter()
            .map(|t| t.currents_a.len())
            .min()
            .unwrap_or(0);
        for trace in &traces {
            if trace.currents_a.len() != ticks {
                reporter.warn(format_args!(
                    "Rail '{}' has {} samples, cutting to {}",
                    trace.name,
                    trace.currents_a.len(),
                    ticks
                ));
            }
        }

        let rails = traces
            .iter()
            .map(|trace| {
                let mut watts = trace.watts();
                watts.truncate(ticks);
                RailColumn {
                    name: trace.name.clone(),
                    watts,
                    board_temperature_c: trace.board_temperature_c,
                }
            })
            .collect();

        let hz = f64::from(rate.hz());
        let time_s = (0..ticks).map(|i| i as f64 / hz).collect();
        let grid = events.map(|records| align(&records, rate, ticks, reporter));
        let register_names = grid.as_deref().map(register_names).unwrap_or_default();

        Self {
            rate,
            time_s,
            rails,
            grid,
            register_names,
        }
    }

    /// Number of ticks.
    pub fn len(&self) -> usize {
        self.time_s.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.time_s.is_empty()
    }

    /// Board temperature of every rail that reported one.
    pub fn board_temperatures(&self) -> BTreeMap<String, f64> {
        self.rails
            .iter()
            .filter_map(|r| r.board_temperature_c.map(|t| (r.name.clone(), t)))
            .collect()
    }

    /// Register columns of the grid, sorted.
    pub fn register_names(&self) -> &[String] {
        &self.register_names
    }

    /// Column names.
    pub fn headers(&self) -> Vec<String> {
        let mut headers = vec!["time_s".to_string()];
        headers.extend(self.rails.iter().map(|r| format!("{}_W", r.name)));
        if self.grid.is_some() {
            headers.extend(["seq_changed", "seq_index", "seq_label"].map(String::from));
            headers.extend(self.register_names.iter().cloned());
        }
        headers
    }

    /// Rows matching [`headers`](Self::headers).
    pub fn rows(&self) -> Vec<Vec<String>> {
        (0..self.len())
            .map(|i| {
                let mut row = vec![self.time_s[i].to_string()];
                row.extend(self.rails.iter().map(|r| r.watts[i].to_string()));
                if let Some(grid) = &self.grid {
                    let g = &grid[i];
                    row.push(u8::from(g.changed).to_string());
                    row.push(g.sequence.to_string());
                    row.push(g.label.clone());
                    row.extend(
                        self.register_names
                            .iter()
                            .map(|name| g.registers.get(name).cloned().unwrap_or_default()),
                    );
                }
                row
            })
            .collect()
    }

    /// Per-state duration, mean power and energy, in order of first appearance.
    pub fn state_summaries(&self) -> Vec<StateSummary> {
        let dt = self.rate.period_s();
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for i in 0..self.len() {
            let label = self
                .grid
                .as_ref()
                .map_or(ALL_STATES, |grid| grid[i].label.as_str());
            match groups.iter_mut().find(|(l, _)| l == label) {
                Some((_, ticks)) => ticks.push(i),
                None => groups.push((label.to_string(), vec![i])),
            }
        }

        groups
            .into_iter()
            .map(|(label, ticks)| {
                let samples = ticks.len();
                let mut mean_power_w = Vec::with_capacity(self.rails.len());
                let mut energy_j = Vec::with_capacity(self.rails.len());
                for rail in &self.rails {
                    let sum: f64 = ticks.iter().map(|&i| rail.watts[i]).sum();
                    mean_power_w.push((rail.name.clone(), sum / samples as f64));
                    energy_j.push((rail.name.clone(), sum * dt));
                }
                StateSummary {
                    label,
                    samples,
                    duration_s: samples as f64 * dt,
                    mean_power_w,
                    energy_j,
                }
            })
            .collect()
    }
}
