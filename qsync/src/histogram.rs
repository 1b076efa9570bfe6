//! Fixed-bin histogram for per-quantum wall-clock observations.
//!
//! [`TimeHistogram`] buckets scalar samples (nanoseconds of wall-clock time
//! spent settling a quantum, typically) into a fixed number of equal-width
//! bins over `[min, max)`, with separate overflow and underflow tallies for
//! samples outside that range.

use std::fmt::Write as _;

/// A fixed-bin histogram of `u64` observations.
///
/// Bins cover `[min, max)` split into `bin_count` equal-width buckets.
/// Samples below `min` increment `underflow_count`; samples at or above
/// `max` increment `overflow_count`.
#[derive(Debug, Clone)]
pub struct TimeHistogram {
    bins: Vec<u64>,
    overflow_count: u64,
    underflow_count: u64,
    min: u64,
    max: u64,
    bin_width: u64,
}

impl TimeHistogram {
    /// Creates a histogram with `bin_count` equal-width bins spanning `[min, max)`.
    ///
    /// # Panics
    ///
    /// Panics if `bin_count == 0` or `max <= min`.
    pub fn new(bin_count: usize, min: u64, max: u64) -> Self {
        assert!(bin_count > 0, "histogram must have at least one bin");
        assert!(max > min, "histogram range must be non-empty (min < max)");
        Self {
            bins: vec![0; bin_count],
            overflow_count: 0,
            underflow_count: 0,
            min,
            max,
            bin_width: (max - min) / bin_count as u64,
        }
    }

    /// Records one observation.
    pub fn add_data_point(&mut self, data_point: u64) {
        if data_point < self.min {
            self.underflow_count += 1;
        } else if data_point >= self.max {
            self.overflow_count += 1;
        } else {
            let bin_index = ((data_point - self.min) / self.bin_width) as usize;
            let bin_index = bin_index.min(self.bins.len() - 1);
            self.bins[bin_index] += 1;
        }
    }

    /// Number of bins.
    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    /// Count recorded in bin `index`, or `None` if out of range.
    pub fn bin(&self, index: usize) -> Option<u64> {
        self.bins.get(index).copied()
    }

    /// Number of samples that fell below `min`.
    pub fn underflow_count(&self) -> u64 {
        self.underflow_count
    }

    /// Number of samples that fell at or above `max`.
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    /// Total number of samples recorded, including over/underflow.
    pub fn total_count(&self) -> u64 {
        self.bins.iter().sum::<u64>() + self.overflow_count + self.underflow_count
    }

    /// Renders the textual bin dump written to `quantum_histogram_<index>.log`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, count) in self.bins.iter().enumerate() {
            let lower_bound = self.min + i as u64 * self.bin_width;
            let upper_bound = lower_bound + self.bin_width - 1;
            let _ = writeln!(out, "Bin {} ({} - {}): {}", i + 1, lower_bound, upper_bound, count);
        }
        let _ = writeln!(out, "Underflow count: {}", self.underflow_count);
        let _ = writeln!(out, "Overflow count: {}", self.overflow_count);
        out
    }

    /// Writes the textual bin dump to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::QSyncError::PersistedOutput`] if the file
    /// cannot be written.
    pub fn write_to_file(&self, path: impl AsRef<std::path::Path>) -> crate::error::Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.render()).map_err(|source| {
            crate::error::QSyncError::PersistedOutput {
                path: path.display().to_string(),
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bins_partition_the_range() {
        let mut h = TimeHistogram::new(10, 0, 100);
        for v in [0, 9, 10, 50, 99] {
            h.add_data_point(v);
        }
        assert_eq!(h.bin(0), Some(2));
        assert_eq!(h.bin(1), Some(1));
        assert_eq!(h.bin(5), Some(1));
        assert_eq!(h.bin(9), Some(1));
        assert_eq!(h.underflow_count(), 0);
        assert_eq!(h.overflow_count(), 0);
        assert_eq!(h.total_count(), 5);
    }

    #[test]
    fn out_of_range_samples_go_to_over_underflow() {
        let mut h = TimeHistogram::new(4, 10, 50);
        h.add_data_point(0);
        h.add_data_point(9);
        h.add_data_point(50);
        h.add_data_point(1_000);
        assert_eq!(h.underflow_count(), 2);
        assert_eq!(h.overflow_count(), 2);
        assert_eq!(h.total_count(), 4);
    }

    #[test]
    fn render_includes_all_bins_and_tallies() {
        let mut h = TimeHistogram::new(2, 0, 10);
        h.add_data_point(1);
        h.add_data_point(100);
        let text = h.render();
        assert!(text.contains("Bin 1"));
        assert!(text.contains("Bin 2"));
        assert!(text.contains("Overflow count: 1"));
        assert!(text.contains("Underflow count: 0"));
    }

    #[test]
    fn write_to_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quantum_histogram_0.log");
        let mut h = TimeHistogram::new(4, 0, 40);
        h.add_data_point(5);
        h.write_to_file(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, h.render());
    }

    #[test]
    #[should_panic(expected = "non-empty")]
    fn rejects_inverted_range() {
        TimeHistogram::new(4, 10, 10);
    }
}
