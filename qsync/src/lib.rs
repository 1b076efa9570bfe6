//! # qsync
//!
//! Quantum-synchronized virtual-time scheduler core for multi-threaded
//! dynamic-binary-translation emulators.
//!
//! Each guest CPU (vCPU) runs on its own host thread; left alone those
//! threads drift arbitrarily in simulated time. `qsync` forces the set of
//! participating vCPU threads to advance in lock-step quanta of virtual
//! (guest) time, so that every inter-vCPU ordering a guest can observe
//! (shared memory, timer events, inter-processor interrupts) respects a
//! deterministic virtual-time frontier regardless of host scheduling
//! jitter.
//!
//! **Status**: the driver/executor boundary is a trait; this crate does not
//! include a translator, an exception dispatcher, or guest I/O. Those are
//! supplied by the emulator embedding `qsync`.
//!
//! ## Key properties
//!
//! - Spin-polling barrier, no condition variables — quanta are short enough
//!   that parking/unparking latency would dominate.
//! - Wait-free membership changes (`join`/`leave`) under a fair ticket lock.
//! - Per-vCPU budget and generation packed into one 64-bit atomic word so
//!   peers can read both fields without tearing.
//! - Two idle-reconciliation policies for vCPUs that block on host I/O.
//!
//! ## Quick start
//!
//! ```rust
//! use qsync::barrier::DynamicBarrier;
//!
//! let barrier = DynamicBarrier::new();
//! let (generation, _frontier) = barrier.join();
//! // ... run a quantum's worth of instructions ...
//! let next_generation = barrier.wait(generation);
//! assert_eq!(next_generation, generation + 1);
//! barrier.leave();
//! ```
//!
//! ## Architecture
//!
//! - [`config`] — parsed, immutable [`config::QuantumConfig`]
//! - [`histogram`] — fixed-bin [`histogram::TimeHistogram`]
//! - [`account`] — per-vCPU [`account::QuantumAccount`] and deduction helpers
//! - [`barrier`] — [`barrier::DynamicBarrier`], the generation barrier
//! - [`clock`] — [`clock::VirtualClock`], per-vCPU virtual timestamps
//! - [`driver`] — [`driver::VcpuDriver`], the per-thread run loop
//! - [`stats`] — persisted per-vCPU statistics writers
//! - [`error`] — error types

pub mod account;
pub mod barrier;
pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod histogram;
pub mod stats;

pub use account::QuantumAccount;
pub use barrier::DynamicBarrier;
pub use clock::VirtualClock;
pub use config::{IdlePolicy, QuantumConfig, QuantumConfigBuilder};
pub use driver::{Executor, ExitReason, VcpuDriver};
pub use error::{ConfigError, QSyncError, Result};
pub use histogram::TimeHistogram;
