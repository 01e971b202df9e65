//! CSV output of a capture, behind the `storage_csv` feature.
//!
//! A capture produces two files in the output directory:
//!
//! - `capture_<UTC timestamp>.csv`: one row per grid tick, see
//!   [`Dataset::headers`]
//! - `capture_<UTC timestamp>_states.csv`: one row per state summary
//!
//! Both start with the run metadata as `# `-prefixed JSON lines.

use crate::capture::{Dataset, StateSummary};
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Run description written at the top of every output file.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureMetadata {
    #[allow(missing_docs)]
    pub application: String,
    #[allow(missing_docs)]
    pub started: DateTime<Utc>,
    #[allow(missing_docs)]
    pub rate_hz: u32,
    #[allow(missing_docs)]
    pub duration_us: u64,
    /// Device names in declaration order.
    pub devices: Vec<String>,    /// Instrument board temperature per rail, °C.
    pub board_temperatures_c: BTreeMap<String, f64>,
}

/// Paths of the files written for one capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFiles {
    #[allow(missing_docs)]
    pub samples: PathBuf,
    #[allow(missing_docs)]
    pub states: PathBuf,
}

/// Header of the state summary file for `rails`.
pub fn summary_headers(rails: &[String]) -> Vec<String> {
    let mut headers = vec![
        "state".to_string(),
        "samples".to_string(),
        "duration_s".to_string(),
    ];
    headers.extend(rails.iter().map(|r| format!("{}_mean_W", r)));
    headers.extend(rails.iter().map(|r| format!("{}_energy_J", r)));
    headers
}

fn summary_row(summary: &StateSummary) -> Vec<String> {
    let mut row = vec![
        summary.label.clone(),
        summary.samples.to_string(),
        summary.duration_s.to_string(),
    ];
    row.extend(summary.mean_power_w.iter().map(|(_, w)| w.to_string()));
    row.extend(summary.energy_j.iter().map(|(_, j)| j.to_string()));
    row
}

fn file_stem(started: &DateTime<Utc>) -> String {
    format!("capture_{}", started.format("%Y%m%d_%H%M%S"))
}

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    /// Writes datasets as CSV files into one directory.
    pub struct CsvWriter {
        output_dir: PathBuf,
    }

    impl CsvWriter {
        #[allow(missing_docs)]
        pub fn new(output_dir: impl Into<PathBuf>) -> Self {
            Self {
                output_dir: output_dir.into(),
            }
        }

        /// Write the sample and state files, creating the directory if needed.
        pub fn write(&self, dataset: &Dataset, metadata: &CaptureMetadata) -> AppResult<WrittenFiles> {
            if !self.output_dir.exists() {
                std::fs::create_dir_all(&self.output_dir)?;
            }
            let stem = file_stem(&metadata.started);
            let files = WrittenFiles {
                samples: self.output_dir.join(format!("{}.csv", stem)),
                states: self.output_dir.join(format!("{}_states.csv", stem)),
            };

            Self::write_table(
                &files.samples,
                metadata,
                dataset.headers(),
                dataset.rows(),
            )?;

            let rails: Vec<String> = dataset.rails.iter().map(|r| r.name.clone()).collect();
            Self::write_table(
                &files.states,
                metadata,
                summary_headers(&rails),
                dataset.state_summaries().iter().map(summary_row).collect(),
            )?;

            log::info!(
                "CSV output written to '{}' and '{}'.",
                files.samples.display(),
                files.states.display()
            );
            Ok(files)
        }

        fn write_table(
            path: &Path,
            metadata: &CaptureMetadata,
            headers: Vec<String>,
            rows: Vec<Vec<String>>,
        ) -> AppResult<()> {
            let mut file = File::create(path)?;
            let json = serde_json::to_string_pretty(metadata).map_err(|e| {
                DaqError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;
            for line in json.lines() {
                writeln!(file, "# {}", line)?;
            }

            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(&headers)?;
            for row in rows {
                writer.write_record(&row)?;
            }
            writer.flush()?;
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    /// Placeholder returning [`DaqError::FeatureNotEnabled`].
    pub struct CsvWriter;

    impl CsvWriter {
        #[allow(missing_docs)]
        pub fn new(_output_dir: impl Into<PathBuf>) -> Self {
            Self
        }

        #[allow(missing_docs)]
        pub fn write(&self, _dataset: &Dataset, _metadata: &CaptureMetadata) -> AppResult<WrittenFiles> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvWriter;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvWriter;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_uses_utc_timestamp() {
        let started = DateTime::parse_from_rfc3339("2024-03-05T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(file_stem(&started), "capture_20240305_070809");
    }

    #[test]
    fn test_summary_layout() {
        let rails = vec!["VDDIO".to_string(), "VDDCORE".to_string()];
        assert_eq!(
            summary_headers(&rails),
            vec![
                "state",
                "samples",
                "duration_s",
                "VDDIO_mean_W",
                "VDDCORE_mean_W",
                "VDDIO_energy_J",
                "VDDCORE_energy_J"
            ]
        );
        let summary = StateSummary {
            label: "RUN".into(),
            samples: 4,
            duration_s: 0.4,
            mean_power_w: vec![("VDDIO".into(), 2.0), ("VDDCORE".into(), 0.5)],
            energy_j: vec![("VDDIO".into(), 0.8), ("VDDCORE".into(), 0.2)],
        };
        assert_eq!(
            summary_row(&summary),
            vec!["RUN", "4", "0.4", "2", "0.5", "0.8", "0.2"]
        );
    }
}
