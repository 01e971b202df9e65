//! Alignment of the sparse event log onto the rail sample grid.
//!
//! Tick `i` covers `[i / f, (i + 1) / f)`. At most one pending event is matched
//! per tick and a matched event is consumed. Labels and registers are
//! forward-filled between matches; ticks before the first match carry
//! [`NOT_FOUND`] and no registers.

use super::event_log::EventRecord;
use crate::instrument::SamplingRate;
use crate::logging::Reporter;
use std::collections::BTreeMap;

/// Label of ticks that precede every logged event.
pub const NOT_FOUND: &str = "NOT_FOUND";

const EPSILON: f64 = 1e-9;

/// One tick of the rail grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GridRow {
    /// An event was matched on this tick.
    pub changed: bool,
    /// Number of the current sequence, 0 before the first event.
    pub sequence: usize,
    #[allow(missing_docs)]
    pub label: String,
    /// Register snapshot of the current sequence, empty before the first event.
    pub registers: BTreeMap<String, String>,
}

/// Events in log order, without those closer than one tick to the event
/// logged just before them.
///
/// Every event is compared with its immediate predecessor whether or not
/// that predecessor was kept, so a burst of closely spaced events collapses
/// onto its first member.
pub fn distinguishable_events<'a>(
    events: &'a [EventRecord],
    rate: SamplingRate,
    reporter: &Reporter,
) -> Vec<&'a EventRecord> {
    let period = rate.period_s();
    let mut kept: Vec<&EventRecord> = Vec::with_capacity(events.len());
    let mut previous: Option<&EventRecord> = None;
    for event in events {
        match previous {
            Some(prev) if event.timestamp_s - prev.timestamp_s < period - EPSILON => {
                reporter.warn(format_args!(
                    "Dropping event '{}' at {:.6}s: only {:.6}s after '{}', below the {:.6}s grid period",
                    event.label,
                    event.timestamp_s,
                    event.timestamp_s - prev.timestamp_s,
                    prev.label,
                    period
                ));
            }
            _ => kept.push(event),
        }
        previous = Some(event);
    }
    kept
}

/// Produce one [`GridRow`] per tick.
pub fn align(
    events: &[EventRecord],
    rate: SamplingRate,
    ticks: usize,
    reporter: &Reporter,
) -> Vec<GridRow> {
    let kept = distinguishable_events(events, rate, reporter);
    let hz = f64::from(rate.hz());

    let mut rows = Vec::with_capacity(ticks);
    let mut next = 0;
    let mut sequence = 0;
    let mut registers: BTreeMap<String, String> = BTreeMap::new();

    for tick in 0..ticks {
        let start = tick as f64 / hz;
        let end = (tick + 1) as f64 / hz;

        // events before this tick can no longer match
        while next < kept.len() && kept[next].timestamp_s < start - EPSILON {
            reporter.warn(format_args!(
                "Event '{}' at {:.6}s precedes the grid and is ignored",
                kept[next].label, kept[next].timestamp_s
            ));
            next += 1;
        }

        let changed = next < kept.len() && kept[next].timestamp_s < end - EPSILON;
        if changed {
            registers = kept[next].registers.clone();
            next += 1;
            sequence = next;
        }

        let label = match sequence {
            0 => NOT_FOUND.to_string(),
            n => kept
                .get(n - 1)
                .map_or_else(|| NOT_FOUND.to_string(), |e| e.label.clone()),
        };

        rows.push(GridRow {
            changed,
            sequence,
            label,
            registers: registers.clone(),
        });
    }

    if next < kept.len() {
        reporter.warn(format_args!(
            "{} events fall after the last of {} ticks",
            kept.len() - next,
            ticks
        ));
    }
    rows
}

/// Sorted union of the register names appearing in `rows`.
pub fn register_names(rows: &[GridRow]) -> Vec<String> {
    let mut names: Vec<String> = rows
        .iter()
        .flat_map(|r| r.registers.keys().cloned())
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(label: &str, t: f64) -> EventRecord {
        let mut registers = BTreeMap::new();
        registers.insert("CR".to_string(), format!("{}-cr", label));
        EventRecord {
            label: label.to_string(),
            timestamp_s: t,
            registers,
        }
    }

    fn rate(hz: u32) -> SamplingRate {
        SamplingRate::new(hz).unwrap()
    }

    #[test]
    fn test_two_events_in_first_window() {
        let events = [event("A", 0.01), event("B", 0.07)];
        let rows = align(&events, rate(10), 4, &Reporter::silent());

        assert!(rows[0].changed);
        assert_eq!(rows[0].sequence, 1);
        assert_eq!(rows[0].label, "A");
        // B is within one period of A and is dropped, never matched later
        for row in &rows[1..] {
            assert!(!row.changed);
            assert_eq!(row.sequence, 1);
            assert_eq!(row.label, "A");
            assert_eq!(row.registers["CR"], "A-cr");
        }
    }

    #[test]
    fn test_not_found_only_before_first_event() {
        let events = [event("RUN", 0.25), event("STOP", 0.55)];
        let rows = align(&events, rate(10), 8, &Reporter::silent());
        let labels: Vec<_> = rows.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                NOT_FOUND, NOT_FOUND, "RUN", "RUN", "RUN", "STOP", "STOP", "STOP"
            ]
        );
        assert!(rows[0].registers.is_empty());
        assert!(rows[2].changed && rows[5].changed);
        assert_eq!(rows.iter().filter(|r| r.changed).count(), 2);
    }

    #[test]
    fn test_window_boundaries() {
        // exactly on a tick boundary belongs to the later tick
        let events = [event("A", 0.1), event("B", 0.2)];
        let rows = align(&events, rate(10), 3, &Reporter::silent());
        assert!(!rows[0].changed);
        assert!(rows[1].changed);
        assert_eq!(rows[1].label, "A");
        assert!(rows[2].changed);
        assert_eq!(rows[2].label, "B");
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let events: Vec<_> = (0..20).map(|i| event(&format!("S{i}"), i as f64 * 0.037)).collect();
        let rows = align(&events, rate(20), 40, &Reporter::silent());
        for pair in rows.windows(2) {
            assert!(pair[1].sequence >= pair[0].sequence);
        }
    }

    #[test]
    fn test_burst_collapses_onto_first_event() {
        // C is a full period after A but only 60 ms after the dropped B
        let events = [event("A", 0.0), event("B", 0.06), event("C", 0.12)];
        let kept = distinguishable_events(&events, rate(10), &Reporter::silent());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].label, "A");

        let rows = align(&events, rate(10), 3, &Reporter::silent());
        assert!(rows.iter().all(|r| r.label == "A"));
        assert_eq!(rows.iter().filter(|r| r.changed).count(), 1);
    }

    #[test]
    fn test_log_order_is_kept() {
        // an event logged with an earlier time than its predecessor is dropped
        let events = [event("A", 0.0), event("C", 0.3), event("B", 0.1), event("D", 0.5)];
        let kept = distinguishable_events(&events, rate(10), &Reporter::silent());
        let labels: Vec<_> = kept.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["A", "C", "D"]);

        let rows = align(&events, rate(10), 6, &Reporter::silent());
        assert_eq!(rows[0].label, "A");
        assert_eq!(rows[3].label, "C");
        assert_eq!(rows[5].label, "D");
        assert_eq!(register_names(&rows), vec!["CR".to_string()]);
    }
}
