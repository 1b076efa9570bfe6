//! Error types for quantum-synchronized scheduling.
//!
//! Per the error-handling design, only configuration problems and
//! persisted-output I/O are recoverable. Everything else — a torn packed
//! word, a `wait()` called with a stale generation, an atomic step issued
//! with a residual `depleted` flag — is a bug trap and is reported with
//! `assert!`/`panic!`, not a `Result`. See the `# Panics` sections on the
//! functions that can trip those assertions.

use thiserror::Error;

/// The top-level error type for all `qsync` operations.
#[derive(Error, Debug)]
pub enum QSyncError {
    /// Error building or validating a [`crate::config::QuantumConfig`].
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Error writing a persisted output (histogram dump, quantum-stats CSV).
    #[error("failed to write '{path}': {source}")]
    PersistedOutput {
        /// The output file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur while building a [`crate::config::QuantumConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    /// `quantum_size` does not fit the budget's signed-32-bit contract —
    /// the barrier's atomic word packs `budget` into the high 32 bits as
    /// a signed value.
    #[error("quantum_size {size} does not fit in a signed 32-bit budget (must be < {max})")]
    QuantumSizeTooLarge {
        /// The requested quantum size.
        size: u64,
        /// The largest quantum size a signed 32-bit budget can hold (`i32::MAX`).
        max: u64,
    },

    /// `check_period` was set but is not a positive multiple of `quantum_size`.
    #[error(
        "check_period {check_period} must be a positive multiple of quantum_size {quantum_size}"
    )]
    CheckPeriodNotMultiple {
        /// The configured check period.
        check_period: u64,
        /// The configured quantum size.
        quantum_size: u64,
    },

    /// The `"lo-hi"` participation-range string could not be parsed.
    #[error("invalid participation range '{range}': {reason}")]
    InvalidRange {
        /// The raw range string.
        range: String,
        /// Why it failed to parse.
        reason: String,
    },

    /// `lo > hi` in an otherwise well-formed participation range.
    #[error("participation range {lo}-{hi} is empty (lo > hi)")]
    EmptyRange {
        /// The lower bound.
        lo: u64,
        /// The upper bound.
        hi: u64,
    },

    /// A row of the `ipc,affinity_core_idx` CSV table failed to parse.
    #[error("invalid per-cpu IPC table row {row}: {reason}")]
    InvalidIpcRow {
        /// The 0-based row index (header excluded).
        row: usize,
        /// Why the row failed to parse.
        reason: String,
    },

    /// The IPC table's header did not match `ipc,affinity_core_idx`.
    #[error("IPC table header must be 'ipc,affinity_core_idx', found '{found}'")]
    InvalidIpcHeader {
        /// The header line actually found.
        found: String,
    },
}

/// Type alias for `Result<T, QSyncError>`.
pub type Result<T> = std::result::Result<T, QSyncError>;
