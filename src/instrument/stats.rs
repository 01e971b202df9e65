//! Summary statistics over a trimmed sample set.

use super::demux::RawSample;

/// Statistics of one acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleStatistics {
    /// Number of samples the statistics were computed over.
    pub count: usize,
    #[allow(missing_docs)]
    pub mean: f64,
    #[allow(missing_docs)]
    pub max: f64,
    #[allow(missing_docs)]
    pub min: f64,
    /// `max - min`.
    pub peak_to_peak: f64,
    /// Population (RMS) standard deviation around the mean.
    pub std_dev: f64,
}

impl SampleStatistics {
    /// Statistics of `values`, `None` when empty.
    pub fn compute(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        Some(Self {
            count: values.len(),
            mean,
            max,
            min,
            peak_to_peak: max - min,
            std_dev: variance.sqrt(),
        })
    }

    /// Statistics of the current values of `samples`.
    pub fn from_samples(samples: &[RawSample]) -> Option<Self> {
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        Self::compute(&values)
    }
}

/// Drop samples from the tail until at most `count` remain.
///
/// Returns how many were discarded; a set already at `count` is left untouched.
pub fn trim_to<T>(samples: &mut Vec<T>, count: usize) -> usize {
    let excess = samples.len().saturating_sub(count);
    samples.truncate(count);
    excess
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_values() {
        let stats = SampleStatistics::compute(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.mean, 2.5);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.peak_to_peak, 3.0);
        assert!((stats.std_dev - 1.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_statistics_empty() {
        assert!(SampleStatistics::compute(&[]).is_none());
    }

    #[test]
    fn test_statistics_idempotent() {
        let samples: Vec<RawSample> = [(0x10, 0x20), (0x21, 0x00), (0x0F, 0xFF)]
            .iter()
            .map(|&(a, b)| RawSample::decode(a, b))
            .collect();
        let first = SampleStatistics::from_samples(&samples);
        let second = SampleStatistics::from_samples(&samples);
        assert_eq!(first, second);
    }

    #[test]
    fn test_trim_from_tail() {
        let mut values = vec![1, 2, 3, 4, 5];
        assert_eq!(trim_to(&mut values, 3), 2);
        assert_eq!(values, vec![1, 2, 3]);
        // already at target: no-op
        assert_eq!(trim_to(&mut values, 3), 0);
        assert_eq!(values, vec![1, 2, 3]);
        // short sets are never padded
        assert_eq!(trim_to(&mut values, 10), 0);
        assert_eq!(values.len(), 3);
    }
}
