//! Parsed, immutable quantum configuration.
//!
//! [`QuantumConfig`] is built once at startup from already-split
//! configuration values (a CLI layer or config file is out of scope here)
//! and validated eagerly rather than at first use.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest quantum size a signed 32-bit budget can hold, since `budget` is
/// packed into the high 32 bits of the barrier's atomic word as `i32`.
const MAX_QUANTUM_SIZE: u64 = 0x7fff_ffff;

/// Threshold above which querying the nearest guest-timer deadline before a
/// release is judged worth its cost. Left hard-coded pending a real consumer
/// that would motivate exposing it; see [`crate::barrier::DynamicBarrier::with_deadline_source`]
/// for the pluggable deadline query itself.
pub const DEADLINE_QUERY_THRESHOLD: u64 = 100_000;

/// Idle-reconciliation policy applied when a participating vCPU wakes from
/// a host I/O wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IdlePolicy {
    /// Increase the sleeping vCPU's `required` by `sleep_duration mod Q`;
    /// any cross-generation remainder is absorbed by waiting an extra
    /// generation.
    DeductRealTime,
    /// Average `max(peer.budget, 0)` over participating peers in the
    /// current generation; never re-grants budget within the same
    /// generation.
    #[default]
    PeekPeers,
}

/// Per-vCPU entry of the `ipc,affinity_core_idx` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerCpuIpc {
    /// Instructions-per-cycle weight. `0` means "not participating".
    pub ipc: u32,
    /// Host affinity core index this vCPU should be pinned to (advisory;
    /// pinning itself is host-runtime plumbing out of scope here).
    pub affinity_core_idx: u32,
}

/// Parsed, immutable configuration for a quantum-synchronized run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantumConfig {
    quantum_size: u64,
    check_period: Option<u64>,
    participation_range: (u64, u64),
    per_cpu_ipc: Vec<PerCpuIpc>,
    respect_deadline: bool,
    idle_policy: IdlePolicy,
}

impl QuantumConfig {
    /// Returns a builder with no fields set.
    pub fn builder() -> QuantumConfigBuilder {
        QuantumConfigBuilder::default()
    }

    /// Quantum length `Q`, in target instructions. `0` disables quantum sync.
    pub fn quantum_size(&self) -> u64 {
        self.quantum_size
    }

    /// Whether quantum synchronization is enabled at all.
    pub fn is_enabled(&self) -> bool {
        self.quantum_size != 0
    }

    /// The configured check period, if one was set.
    pub fn check_period(&self) -> Option<u64> {
        self.check_period
    }

    /// Whether `vcpu_idx` is admitted to the barrier.
    pub fn is_participant(&self, vcpu_idx: u64) -> bool {
        let (lo, hi) = self.participation_range;
        vcpu_idx >= lo && vcpu_idx <= hi
    }

    /// The IPC weight for `vcpu_idx`.
    ///
    /// Returns `1` (unweighted) if no per-CPU IPC table was configured, the
    /// index's entry if the table has one, or `0` if the table was
    /// configured but has no entry for this index.
    pub fn ipc_for(&self, vcpu_idx: u64) -> u32 {
        if self.per_cpu_ipc.is_empty() {
            return 1;
        }
        self.per_cpu_ipc
            .get(vcpu_idx as usize)
            .map(|e| e.ipc)
            .unwrap_or(0)
    }

    /// The host affinity core index configured for `vcpu_idx`, if any.
    pub fn affinity_core_for(&self, vcpu_idx: u64) -> Option<u32> {
        self.per_cpu_ipc
            .get(vcpu_idx as usize)
            .map(|e| e.affinity_core_idx)
    }

    /// Whether the barrier should shrink a generation's budget to honor the
    /// nearest guest-timer deadline.
    pub fn respect_deadline(&self) -> bool {
        self.respect_deadline
    }

    /// The idle-reconciliation policy to apply on wake from host I/O.
    pub fn idle_policy(&self) -> IdlePolicy {
        self.idle_policy
    }
}

/// Builder for [`QuantumConfig`], validating on [`QuantumConfigBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct QuantumConfigBuilder {
    quantum_size: u64,
    check_period: Option<u64>,
    participation_range: Option<String>,
    per_cpu_ipc_table: Option<String>,
    respect_deadline: bool,
    idle_policy: IdlePolicy,
}

impl QuantumConfigBuilder {
    /// Sets the quantum length `Q`, in target instructions.
    pub fn quantum_size(mut self, size: u64) -> Self {
        self.quantum_size = size;
        self
    }

    /// Sets the check period. Must be a positive multiple of `quantum_size`.
    pub fn check_period(mut self, period: u64) -> Self {
        self.check_period = Some(period);
        self
    }

    /// Sets the participation range as an inclusive `"lo-hi"` string.
    /// Omitted (or never called) means "all cores".
    pub fn participation_range(mut self, range: impl Into<String>) -> Self {
        self.participation_range = Some(range.into());
        self
    }

    /// Sets the per-vCPU IPC table, a CSV with header `ipc,affinity_core_idx`
    /// and one data row per vCPU index.
    pub fn per_cpu_ipc_table(mut self, csv: impl Into<String>) -> Self {
        self.per_cpu_ipc_table = Some(csv.into());
        self
    }

    /// Sets whether the barrier honors the nearest guest-timer deadline.
    pub fn respect_deadline(mut self, respect: bool) -> Self {
        self.respect_deadline = respect;
        self
    }

    /// Sets the idle-reconciliation policy.
    pub fn idle_policy(mut self, policy: IdlePolicy) -> Self {
        self.idle_policy = policy;
        self
    }

    /// Validates and constructs a [`QuantumConfig`].
    ///
    /// # Errors
    ///
    /// - [`ConfigError::QuantumSizeTooLarge`] if `quantum_size` does not fit
    ///   a signed 32-bit budget.
    /// - [`ConfigError::CheckPeriodNotMultiple`] if `check_period` is set but
    ///   is not a positive multiple of `quantum_size`.
    /// - [`ConfigError::InvalidRange`] / [`ConfigError::EmptyRange`] if the
    ///   participation range string is malformed or empty.
    /// - [`ConfigError::InvalidIpcHeader`] / [`ConfigError::InvalidIpcRow`]
    ///   if the IPC table is malformed.
    pub fn build(self) -> Result<QuantumConfig, ConfigError> {
        if self.quantum_size >= MAX_QUANTUM_SIZE {
            return Err(ConfigError::QuantumSizeTooLarge {
                size: self.quantum_size,
                max: MAX_QUANTUM_SIZE,
            });
        }

        if let Some(period) = self.check_period {
            if period == 0 || self.quantum_size == 0 || period % self.quantum_size != 0 {
                return Err(ConfigError::CheckPeriodNotMultiple {
                    check_period: period,
                    quantum_size: self.quantum_size,
                });
            }
        }

        let participation_range = match &self.participation_range {
            None => (0, u64::MAX),
            Some(range) => parse_range(range)?,
        };

        let per_cpu_ipc = match &self.per_cpu_ipc_table {
            None => Vec::new(),
            Some(csv) => parse_ipc_table(csv)?,
        };

        Ok(QuantumConfig {
            quantum_size: self.quantum_size,
            check_period: self.check_period,
            participation_range,
            per_cpu_ipc,
            respect_deadline: self.respect_deadline,
            idle_policy: self.idle_policy,
        })
    }
}

fn parse_range(range: &str) -> Result<(u64, u64), ConfigError> {
    let (lo_str, hi_str) = range.split_once('-').ok_or_else(|| ConfigError::InvalidRange {
        range: range.to_string(),
        reason: "expected 'lo-hi'".to_string(),
    })?;
    let lo: u64 = lo_str.trim().parse().map_err(|_| ConfigError::InvalidRange {
        range: range.to_string(),
        reason: format!("'{lo_str}' is not a valid lower bound"),
    })?;
    let hi: u64 = hi_str.trim().parse().map_err(|_| ConfigError::InvalidRange {
        range: range.to_string(),
        reason: format!("'{hi_str}' is not a valid upper bound"),
    })?;
    if lo > hi {
        return Err(ConfigError::EmptyRange { lo, hi });
    }
    Ok((lo, hi))
}

fn parse_ipc_table(csv: &str) -> Result<Vec<PerCpuIpc>, ConfigError> {
    let mut lines = csv.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().unwrap_or("").trim();
    if header != "ipc,affinity_core_idx" {
        return Err(ConfigError::InvalidIpcHeader {
            found: header.to_string(),
        });
    }
    lines
        .enumerate()
        .map(|(row, line)| {
            let (ipc_str, core_str) = line.split_once(',').ok_or_else(|| ConfigError::InvalidIpcRow {
                row,
                reason: "expected two comma-separated columns".to_string(),
            })?;
            let ipc: u32 = ipc_str.trim().parse().map_err(|_| ConfigError::InvalidIpcRow {
                row,
                reason: format!("'{ipc_str}' is not a valid ipc value"),
            })?;
            let affinity_core_idx: u32 =
                core_str.trim().parse().map_err(|_| ConfigError::InvalidIpcRow {
                    row,
                    reason: format!("'{core_str}' is not a valid affinity core index"),
                })?;
            Ok(PerCpuIpc {
                ipc,
                affinity_core_idx,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_all_cores_and_unweighted_ipc() {
        let cfg = QuantumConfig::builder().quantum_size(1000).build().unwrap();
        assert!(cfg.is_participant(0));
        assert!(cfg.is_participant(u64::MAX));
        assert_eq!(cfg.ipc_for(0), 1);
        assert_eq!(cfg.idle_policy(), IdlePolicy::PeekPeers);
    }

    #[test]
    fn quantum_size_must_fit_signed_32_bit_budget() {
        let err = QuantumConfig::builder()
            .quantum_size(MAX_QUANTUM_SIZE)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::QuantumSizeTooLarge { .. }));
    }

    #[test]
    fn check_period_must_be_a_multiple_of_quantum_size() {
        let err = QuantumConfig::builder()
            .quantum_size(1000)
            .check_period(1500)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::CheckPeriodNotMultiple { .. }));

        let ok = QuantumConfig::builder()
            .quantum_size(1000)
            .check_period(3000)
            .build()
            .unwrap();
        assert_eq!(ok.check_period(), Some(3000));
    }

    #[test]
    fn parses_explicit_participation_range() {
        let cfg = QuantumConfig::builder()
            .quantum_size(1000)
            .participation_range("2-4")
            .build()
            .unwrap();
        assert!(!cfg.is_participant(1));
        assert!(cfg.is_participant(2));
        assert!(cfg.is_participant(4));
        assert!(!cfg.is_participant(5));
    }

    #[test]
    fn rejects_inverted_range() {
        let err = QuantumConfig::builder()
            .quantum_size(1000)
            .participation_range("5-2")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyRange { lo: 5, hi: 2 }));
    }

    #[test]
    fn rejects_malformed_range() {
        let err = QuantumConfig::builder()
            .quantum_size(1000)
            .participation_range("not-a-range")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRange { .. }));
    }

    #[test]
    fn parses_per_cpu_ipc_table() {
        let cfg = QuantumConfig::builder()
            .quantum_size(1000)
            .per_cpu_ipc_table("ipc,affinity_core_idx\n100,0\n50,1\n")
            .build()
            .unwrap();
        assert_eq!(cfg.ipc_for(0), 100);
        assert_eq!(cfg.affinity_core_for(0), Some(0));
        assert_eq!(cfg.ipc_for(1), 50);
        assert_eq!(cfg.ipc_for(2), 0); // configured table, no entry -> non-participant
    }

    #[test]
    fn rejects_ipc_table_with_bad_header() {
        let err = QuantumConfig::builder()
            .quantum_size(1000)
            .per_cpu_ipc_table("wrong,header\n1,0\n")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIpcHeader { .. }));
    }

    #[test]
    fn rejects_malformed_ipc_row() {
        let err = QuantumConfig::builder()
            .quantum_size(1000)
            .per_cpu_ipc_table("ipc,affinity_core_idx\nnotanumber,0\n")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIpcRow { row: 0, .. }));
    }
}
