//! Persisted per-vCPU quantum statistics.
//!
//! One CSV per vCPU, prefixed by a single summary line
//! (`enter_idle_time,target_cycle_on_idle,target_cycle_on_instruction`)
//! followed by one data row per quantum
//! (`total_time,execution_time,waiting_time,idle_time,peeking_other_time`),
//! plus a periodic low-frequency summary row of cumulative instruction
//! counts appended whenever `(next_generation * quantum_size) % 1_000_000
//! == 0`, folded into this same writer since there's only one persisted
//! file per vCPU here.

use crate::error::QSyncError;

/// One quantum's worth of timing breakdown for a single vCPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuantumRow {
    /// Total wall-clock time spent in this quantum.
    pub total_time: u64,
    /// Time spent executing translated slices.
    pub execution_time: u64,
    /// Time spent in `DynamicBarrier::wait`.
    pub waiting_time: u64,
    /// Time spent idle (blocked on host I/O).
    pub idle_time: u64,
    /// Time spent reading peer accounts during idle reconciliation.
    pub peeking_other_time: u64,
}

/// The single summary line prefixing a vCPU's statistics CSV.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuantumSummary {
    /// Wall-clock time at which this vCPU most recently entered idle.
    pub enter_idle_time: u64,
    /// Target-cycle count observed the last time this vCPU went idle.
    pub target_cycle_on_idle: u64,
    /// Target-cycle count observed at the last instruction boundary.
    pub target_cycle_on_instruction: u64,
}

/// Accumulates per-quantum rows and periodic instruction-count summaries
/// for one vCPU, and renders them to the persisted CSV.
#[derive(Debug, Clone, Default)]
pub struct QuantumStatsWriter {
    summary: QuantumSummary,
    rows: Vec<QuantumRow>,
    total_icount: u64,
    exclusive_icount: u64,
    periodic_rows: Vec<(u64, u64)>,
}

impl QuantumStatsWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the summary line.
    pub fn set_summary(&mut self, summary: QuantumSummary) {
        self.summary = summary;
    }

    /// Appends one quantum's timing row.
    pub fn record_quantum(&mut self, row: QuantumRow) {
        self.rows.push(row);
    }

    /// Adds to the normal-instruction counter.
    pub fn add_icount(&mut self, count: u64) {
        self.total_icount += count;
    }

    /// Adds to the atomic/exclusive-instruction counter.
    pub fn add_exclusive_icount(&mut self, count: u64) {
        self.exclusive_icount += count;
    }

    /// Whether a periodic low-frequency summary row is due for
    /// `next_generation` at this `quantum_size`, and if so, appends it.
    pub fn maybe_record_periodic(&mut self, next_generation: u64, quantum_size: u64) {
        if quantum_size == 0 {
            return;
        }
        if (next_generation * quantum_size) % 1_000_000 == 0 {
            self.periodic_rows.push((self.total_icount, self.exclusive_icount));
        }
    }

    /// Total normal instructions executed so far.
    pub fn total_icount(&self) -> u64 {
        self.total_icount
    }

    /// Total atomic/exclusive instructions executed so far.
    pub fn exclusive_icount(&self) -> u64 {
        self.exclusive_icount
    }

    /// Renders the CSV text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("enter_idle_time,target_cycle_on_idle,target_cycle_on_instruction\n");
        out.push_str(&format!(
            "{},{},{}\n",
            self.summary.enter_idle_time,
            self.summary.target_cycle_on_idle,
            self.summary.target_cycle_on_instruction
        ));
        out.push_str("total_time,execution_time,waiting_time,idle_time,peeking_other_time\n");
        for row in &self.rows {
            out.push_str(&format!(
                "{},{},{},{},{}\n",
                row.total_time, row.execution_time, row.waiting_time, row.idle_time, row.peeking_other_time
            ));
        }
        if !self.periodic_rows.is_empty() {
            out.push_str("total_icount,exclusive_icount\n");
            for (total, exclusive) in &self.periodic_rows {
                out.push_str(&format!("{total},{exclusive}\n"));
            }
        }
        out
    }

    /// Writes the CSV to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`QSyncError::PersistedOutput`] if the file cannot be
    /// written.
    pub fn write_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), QSyncError> {
        let path = path.as_ref();
        std::fs::write(path, self.render()).map_err(|source| QSyncError::PersistedOutput {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_summary_header_then_rows() {
        let mut w = QuantumStatsWriter::new();
        w.set_summary(QuantumSummary {
            enter_idle_time: 10,
            target_cycle_on_idle: 20,
            target_cycle_on_instruction: 30,
        });
        w.record_quantum(QuantumRow {
            total_time: 100,
            execution_time: 80,
            waiting_time: 15,
            idle_time: 0,
            peeking_other_time: 5,
        });
        let text = w.render();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "enter_idle_time,target_cycle_on_idle,target_cycle_on_instruction");
        assert_eq!(lines[1], "10,20,30");
        assert_eq!(lines[2], "total_time,execution_time,waiting_time,idle_time,peeking_other_time");
        assert_eq!(lines[3], "100,80,15,0,5");
    }

    #[test]
    fn periodic_row_only_recorded_on_boundary() {
        let mut w = QuantumStatsWriter::new();
        w.add_icount(500);
        w.maybe_record_periodic(999, 1000); // 999_000 % 1_000_000 != 0
        assert!(!w.render().contains("total_icount"));

        w.maybe_record_periodic(1000, 1000); // 1_000_000 % 1_000_000 == 0
        assert!(w.render().contains("total_icount,exclusive_icount"));
        assert!(w.render().contains("500,0"));
    }

    #[test]
    fn write_to_file_persists_rendered_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quantum_stats_0.csv");
        let mut w = QuantumStatsWriter::new();
        w.record_quantum(QuantumRow::default());
        w.write_to_file(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), w.render());
    }
}
