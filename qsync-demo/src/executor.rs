//! A synthetic translated-slice executor.
//!
//! Stands in for the real translator/exception-dispatcher/guest-I/O
//! collaborators `qsync::driver::Executor` defers to an embedding emulator;
//! here each "slice" just burns a configurable instruction count and
//! occasionally raises a debug or atomic exception so the demo exercises
//! every branch of the driver loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use qsync::QuantumAccount;
use qsync::driver::{ExceptionCode, Executor};

/// Synthetic per-vCPU workload: every slice deducts `slice_cost`
/// instructions, one slice in `atomic_every` raises [`ExceptionCode::Atomic`],
/// and the vCPU idles for `idle_every_nanos` once per `idle_every` slices
/// before unplugging after `total_slices`.
pub struct SyntheticExecutor {
    accounts: Arc<[QuantumAccount]>,
    slice_cost: u32,
    atomic_every: u32,
    idle_every: u32,
    idle_duration: Duration,
    total_slices: u32,
    slices_run: Vec<AtomicU32>,
    total_idle_nanos: AtomicU64,
}

impl SyntheticExecutor {
    /// Builds an executor over the shared `accounts` slice (one entry per
    /// vCPU), configured with the given workload shape.
    pub fn new(
        accounts: Arc<[QuantumAccount]>,
        vcpu_count: u64,
        slice_cost: u32,
        atomic_every: u32,
        idle_every: u32,
        idle_duration: Duration,
        total_slices: u32,
    ) -> Self {
        Self {
            accounts,
            slice_cost,
            atomic_every: atomic_every.max(1),
            idle_every: idle_every.max(1),
            idle_duration,
            total_slices,
            slices_run: (0..vcpu_count).map(|_| AtomicU32::new(0)).collect(),
            total_idle_nanos: AtomicU64::new(0),
        }
    }

    /// Total nanoseconds every vCPU spent blocked in [`Executor::wait_io_event`].
    pub fn total_idle_nanos(&self) -> u64 {
        self.total_idle_nanos.load(Ordering::Relaxed)
    }
}

impl Executor for SyntheticExecutor {
    fn run_slice(&self, vcpu_idx: u64) -> ExceptionCode {
        let count = self.slices_run[vcpu_idx as usize].fetch_add(1, Ordering::Relaxed) + 1;
        let account = &self.accounts[vcpu_idx as usize];
        account.set_required(self.slice_cost);

        if count.is_multiple_of(self.atomic_every) {
            return ExceptionCode::Atomic;
        }
        if account.helper_check_and_deduct() {
            return ExceptionCode::Quantum;
        }
        ExceptionCode::Normal
    }

    fn step_atomic(&self, vcpu_idx: u64) {
        let account = &self.accounts[vcpu_idx as usize];
        account.set_required(self.slice_cost);
        account.helper_deduct();
    }

    fn wait_io_event(&self, vcpu_idx: u64, _first_time: bool) -> bool {
        let count = self.slices_run[vcpu_idx as usize].load(Ordering::Relaxed);
        if self.idle_duration.is_zero() || !count.is_multiple_of(self.idle_every) {
            return false;
        }
        self.total_idle_nanos
            .fetch_add(self.idle_duration.as_nanos() as u64, Ordering::Relaxed);
        std::thread::sleep(self.idle_duration);
        true
    }

    fn handle_debug(&self, _vcpu_idx: u64) {}

    fn should_unplug(&self, vcpu_idx: u64) -> bool {
        self.slices_run[vcpu_idx as usize].load(Ordering::Relaxed) >= self.total_slices
    }
}
