//! The per-vCPU run loop: alternates executing a translated slice, settling
//! with the barrier, and waiting for the next I/O event.
//!
//! The translator, the exception dispatcher, and guest I/O are external
//! collaborators. [`Executor`] is the seam the core consumes them through;
//! a real emulator implements it over its own translation cache and
//! devices, and [`crate::config`]/[`crate::barrier`]/[`crate::account`]
//! never need to know about either.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::account::QuantumAccount;
use crate::barrier::DynamicBarrier;
use crate::clock::VirtualClock;
use crate::config::{IdlePolicy, QuantumConfig};
use crate::stats::{QuantumRow, QuantumStatsWriter, QuantumSummary};

/// The exception code a translated slice returns to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    /// No exceptional condition; resume executing normally.
    Normal,
    /// A debug event (breakpoint, watchpoint, single-step) fired.
    Debug,
    /// The vCPU halted (e.g. executed `hlt`).
    Halted,
    /// The next guest instruction must run as an isolated atomic step.
    Atomic,
    /// The slice returned purely because the quantum boundary was hit;
    /// no other dispatch is needed once settled.
    Quantum,
}

/// Driver-thread state, mirroring the run loop's phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// The vCPU thread has not yet made its first runnable transition.
    NotRunning,
    /// Running a translated slice.
    Executing,
    /// Inside the barrier settle loop.
    Settling,
    /// Blocked in the external I/O-wait call.
    Idling,
    /// Executing one isolated atomic instruction.
    AtomicStep,
    /// The loop has exited.
    Exited,
}

/// Why [`VcpuDriver::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Unplug was requested and no work remained.
    Unplugged,
    /// The translator reported an unrecoverable abort.
    TranslatorAborted(String),
}

/// The driver↔executor boundary: everything the core consumes from the
/// translator, the exception dispatcher, and guest I/O.
pub trait Executor: Send + Sync {
    /// Runs a translated slice for `vcpu_idx` and returns the exception
    /// code it exited with.
    fn run_slice(&self, vcpu_idx: u64) -> ExceptionCode;

    /// Executes one guest instruction atomically, isolated from all other
    /// vCPUs.
    fn step_atomic(&self, vcpu_idx: u64);

    /// Waits for the next I/O event for `vcpu_idx`. `first_time` is true on
    /// the first call after the vCPU's initial runnable transition. Returns
    /// whether the host thread actually slept.
    fn wait_io_event(&self, vcpu_idx: u64, first_time: bool) -> bool;

    /// Dispatches a debug event to an external handler.
    fn handle_debug(&self, vcpu_idx: u64);

    /// Whether unplug has been requested for `vcpu_idx` and no further
    /// work remains.
    fn should_unplug(&self, vcpu_idx: u64) -> bool;

    /// Whether a translator abort occurred; if so, with what message.
    fn translator_aborted(&self, vcpu_idx: u64) -> Option<String> {
        let _ = vcpu_idx;
        None
    }
}

/// The per-thread loop that alternates (execute translated slice) with
/// (settle with barrier) and (wait for I/O event).
pub struct VcpuDriver {
    vcpu_idx: u64,
    config: Arc<QuantumConfig>,
    barrier: Arc<DynamicBarrier>,
    accounts: Arc<[QuantumAccount]>,
    clock: VirtualClock,
    state: DriverState,
    stats: QuantumStatsWriter,
    histogram_index: Option<usize>,
    event_loop_poll: Option<Arc<dyn Fn() + Send + Sync>>,
    quantum_deplete_cb: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    vcpu_clock_cb: Option<Arc<dyn Fn(u64) -> u64 + Send + Sync>>,
}

impl VcpuDriver {
    /// Creates a driver for vCPU `vcpu_idx`, sharing `config`, `barrier`,
    /// and the full `accounts` slice (one entry per vCPU, indexed by vCPU
    /// index) with every other driver in the run.
    pub fn new(
        vcpu_idx: u64,
        config: Arc<QuantumConfig>,
        barrier: Arc<DynamicBarrier>,
        accounts: Arc<[QuantumAccount]>,
    ) -> Self {
        let quantum_size = config.quantum_size();
        Self {
            vcpu_idx,
            config,
            barrier,
            accounts,
            clock: VirtualClock::new(quantum_size),
            state: DriverState::NotRunning,
            stats: QuantumStatsWriter::new(),
            histogram_index: None,
            event_loop_poll: None,
            quantum_deplete_cb: None,
            vcpu_clock_cb: None,
        }
    }

    /// Sets the optional event-loop-poll plugin callback. At most one
    /// slot; a later call replaces an earlier one.
    pub fn with_event_loop_poll(mut self, cb: impl Fn() + Send + Sync + 'static) -> Self {
        self.event_loop_poll = Some(Arc::new(cb));
        self
    }

    /// Sets the optional quantum-deplete plugin callback, invoked with the
    /// vCPU index each time this driver's account becomes depleted.
    pub fn with_quantum_deplete_callback(mut self, cb: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.quantum_deplete_cb = Some(Arc::new(cb));
        self
    }

    /// Sets the optional vCPU-clock plugin callback.
    pub fn with_vcpu_clock_callback(mut self, cb: impl Fn(u64) -> u64 + Send + Sync + 'static) -> Self {
        self.vcpu_clock_cb = Some(Arc::new(cb));
        self
    }

    /// Registers a histogram with the barrier for this vCPU's per-quantum
    /// wall-clock samples.
    pub fn with_histogram(mut self, histogram: crate::histogram::TimeHistogram) -> Self {
        self.histogram_index = Some(self.barrier.register_histogram(histogram));
        self
    }

    /// Current driver state.
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// The accumulated statistics for this vCPU.
    pub fn stats(&self) -> &QuantumStatsWriter {
        &self.stats
    }

    /// The vCPU's virtual clock.
    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    /// The index this driver's histogram was registered under via
    /// [`VcpuDriver::with_histogram`], if any.
    pub fn histogram_index(&self) -> Option<usize> {
        self.histogram_index
    }

    fn account(&self) -> &QuantumAccount {
        &self.accounts[self.vcpu_idx as usize]
    }

    fn is_participant(&self) -> bool {
        self.config.is_participant(self.vcpu_idx)
    }

    /// Runs the loop until unplug or a translator abort.
    pub fn run(&mut self, executor: &dyn Executor) -> ExitReason {
        self.first_runnable_transition();

        let mut first_wait = true;
        loop {
            if let Some(reason) = executor.translator_aborted(self.vcpu_idx) {
                self.state = DriverState::Exited;
                self.on_exit();
                return ExitReason::TranslatorAborted(reason);
            }

            self.state = DriverState::Executing;
            let exec_start = Instant::now();
            let exception = executor.run_slice(self.vcpu_idx);
            let execution_time = exec_start.elapsed();

            let mut row = QuantumRow {
                execution_time: execution_time.as_nanos() as u64,
                ..Default::default()
            };

            if self.account().is_depleted() {
                self.account().clear_depleted();
                if self.is_participant() {
                    self.state = DriverState::Settling;
                    let waiting_time = self.settle_quantum();
                    row.waiting_time = waiting_time.as_nanos() as u64;
                    if exception == ExceptionCode::Quantum {
                        row.total_time = row.execution_time + row.waiting_time;
                        self.stats.record_quantum(row);
                        continue;
                    }
                }
            }

            match exception {
                ExceptionCode::Debug => executor.handle_debug(self.vcpu_idx),
                ExceptionCode::Halted => {}
                ExceptionCode::Atomic => {
                    let atomic_time = self.run_atomic_step(executor);
                    row.execution_time += atomic_time.as_nanos() as u64;
                }
                ExceptionCode::Normal | ExceptionCode::Quantum => {}
            }

            self.state = DriverState::Idling;
            let idle_start = Instant::now();
            let did_sleep = executor.wait_io_event(self.vcpu_idx, first_wait);
            first_wait = false;
            row.idle_time = idle_start.elapsed().as_nanos() as u64;

            if did_sleep && self.is_participant() {
                let peek_start = Instant::now();
                self.reconcile_idle(row.idle_time);
                row.peeking_other_time = peek_start.elapsed().as_nanos() as u64;
                self.stats.set_summary(QuantumSummary {
                    enter_idle_time: idle_start.elapsed().as_nanos() as u64,
                    target_cycle_on_idle: self.clock.read(self.account()),
                    target_cycle_on_instruction: self.account().virtual_time_base(),
                });
            }

            row.total_time = row.execution_time + row.waiting_time + row.idle_time;
            self.stats.record_quantum(row);

            if let Some(index) = self.histogram_index {
                self.barrier.observe(index, row.total_time);
            }

            if let Some(poll) = &self.event_loop_poll {
                poll();
            }

            if executor.should_unplug(self.vcpu_idx) {
                self.state = DriverState::Exited;
                self.on_exit();
                return ExitReason::Unplugged;
            }
        }
    }

    fn first_runnable_transition(&mut self) {
        debug!(vcpu = self.vcpu_idx, "vcpu entering first runnable transition");
        self.account().init_runnable(self.config.quantum_size());
        self.account().set_unknown_time(false);
        if self.is_participant() {
            let (generation, _frontier) = self.barrier.join();
            self.account().store(self.account().budget(), generation);
        }
        self.state = DriverState::Executing;
    }

    /// Settle loop: waits on the barrier until `budget > 0`, replenishing
    /// on each release. Returns the total time spent waiting.
    fn settle_quantum(&mut self) -> std::time::Duration {
        let start = Instant::now();
        while self.account().budget() <= 0 {
            self.settle_one_generation();
        }
        start.elapsed()
    }

    /// Performs one `wait` + replenish cycle, asserting the expected
    /// generation post-condition.
    ///
    /// # Panics
    ///
    /// Panics if the barrier returns a generation other than
    /// `my_generation + 1` — this would mean two releases fired for a
    /// single `wait`, a barrier invariant violation.
    fn settle_one_generation(&mut self) {
        let my_generation = self.account().generation();
        let next_generation = self.barrier.wait(my_generation);
        assert_eq!(
            next_generation,
            my_generation + 1,
            "barrier produced an unexpected generation jump"
        );

        let replenish = self.barrier.current_generation_budget() * self.account().ipc() as u64;
        let new_budget = self.account().budget() as i64 + replenish as i64;
        let new_budget = i32::try_from(new_budget).unwrap_or(i32::MAX);
        self.account().store(new_budget, next_generation);

        self.stats.add_icount(replenish);
        self.stats
            .maybe_record_periodic(next_generation as u64, self.config.quantum_size());

        trace!(
            vcpu = self.vcpu_idx,
            generation = next_generation,
            budget = new_budget,
            "settled one generation"
        );
    }

    /// Runs one atomic instruction step, first settling until the budget
    /// strictly exceeds the staged `required` debit so the step itself
    /// cannot straddle a quantum boundary.
    ///
    /// # Panics
    ///
    /// Panics if `depleted` is observed set after the pre-budget check —
    /// that would mean the atomic step could still trigger a mid-instruction
    /// quantum boundary, a translator bug.
    fn run_atomic_step(&mut self, executor: &dyn Executor) -> std::time::Duration {
        self.state = DriverState::AtomicStep;
        let required = self.account().required() as i32;

        let start = Instant::now();
        if self.is_participant() {
            while self.account().budget() <= required {
                self.settle_one_generation();
            }
        }

        assert!(
            !self.account().is_depleted(),
            "atomic step issued with a residual depleted flag"
        );

        executor.step_atomic(self.vcpu_idx);

        assert!(
            !self.account().is_depleted(),
            "atomic step unexpectedly depleted the quantum budget"
        );

        self.stats.add_exclusive_icount(1);

        start.elapsed()
    }

    /// Reconciles virtual time after waking from a host I/O sleep.
    /// `sleep_duration_nanos` is the wall-clock time actually spent
    /// blocked in the I/O wait.
    fn reconcile_idle(&mut self, sleep_duration_nanos: u64) {
        match self.config.idle_policy() {
            IdlePolicy::DeductRealTime => self.reconcile_deduct_real_time(sleep_duration_nanos),
            IdlePolicy::PeekPeers => self.reconcile_peek_peers(),
        }
    }

    fn reconcile_deduct_real_time(&mut self, sleep_duration_nanos: u64) {
        let quantum_size = self.config.quantum_size();
        if quantum_size == 0 {
            return;
        }
        let slept_instructions = sleep_duration_nanos % quantum_size;
        self.account().set_required(slept_instructions as u32);
        self.clock.add_carry(slept_instructions);
    }

    fn reconcile_peek_peers(&mut self) {
        let me = self.vcpu_idx;
        let current_generation = self.barrier.generation();
        let mut total: i64 = 0;
        let mut sampled = 0u64;

        for (idx, peer) in self.accounts.iter().enumerate() {
            if idx as u64 == me {
                continue;
            }
            if !self.config.is_participant(idx as u64) {
                continue;
            }
            if peer.is_unknown_time() {
                continue;
            }
            let (budget, generation) = peer.load();
            if generation != current_generation {
                continue;
            }
            total += budget.max(0) as i64;
            sampled += 1;
        }

        let (old_budget, _) = self.account().load();
        if sampled == 0 {
            // No reportable peer: stay in the previous generation, budget
            // unchanged.
            return;
        }

        let averaged = (total / sampled as i64) as i32;
        if averaged < old_budget || self.account().generation() != current_generation {
            self.account().store(averaged, current_generation);
            self.account().set_required(0);
            warn!(
                vcpu = me,
                from = old_budget,
                to = averaged,
                "idle reconciliation adopted peer-averaged budget"
            );
        }
    }

    fn on_exit(&mut self) {
        if self.is_participant() {
            self.barrier.leave();
        }
        if let Some(cb) = &self.quantum_deplete_cb {
            cb(self.vcpu_idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuantumConfig;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A synthetic executor: every slice consumes a fixed instruction
    /// count via a checked deduct, then signals unplug after a fixed
    /// number of slices. Holds the same `accounts` slice the drivers do,
    /// indexing by the `vcpu_idx` each trait method receives.
    struct FixedSliceExecutor {
        accounts: Arc<[QuantumAccount]>,
        slice_cost: u32,
        slices_remaining: Vec<AtomicU32>,
        slices_run: AtomicUsize,
    }

    impl Executor for FixedSliceExecutor {
        fn run_slice(&self, vcpu_idx: u64) -> ExceptionCode {
            self.slices_run.fetch_add(1, Ordering::Relaxed);
            let account = &self.accounts[vcpu_idx as usize];
            account.set_required(self.slice_cost);
            account.helper_check_and_deduct();
            ExceptionCode::Normal
        }

        fn step_atomic(&self, _vcpu_idx: u64) {}

        fn wait_io_event(&self, _vcpu_idx: u64, _first_time: bool) -> bool {
            false
        }

        fn handle_debug(&self, _vcpu_idx: u64) {}

        fn should_unplug(&self, vcpu_idx: u64) -> bool {
            self.slices_remaining[vcpu_idx as usize].fetch_sub(1, Ordering::Relaxed) == 1
        }
    }

    fn single_vcpu_config(quantum_size: u64) -> Arc<QuantumConfig> {
        Arc::new(QuantumConfig::builder().quantum_size(quantum_size).build().unwrap())
    }

    #[test]
    fn settles_through_multiple_generations_and_then_unplugs() {
        let config = single_vcpu_config(100);
        let barrier = Arc::new(DynamicBarrier::new());
        let accounts: Arc<[QuantumAccount]> = Arc::from(vec![QuantumAccount::new(1)]);
        let mut driver = VcpuDriver::new(0, config, barrier, accounts.clone());

        let executor = FixedSliceExecutor {
            accounts,
            slice_cost: 30,
            slices_remaining: vec![AtomicU32::new(10)],
            slices_run: AtomicUsize::new(0),
        };

        let reason = driver.run(&executor);
        assert_eq!(reason, ExitReason::Unplugged);
        assert!(executor.slices_run.load(Ordering::Relaxed) >= 10);
    }

    #[test]
    fn two_vcpus_release_the_barrier_together() {
        let config = Arc::new(
            QuantumConfig::builder()
                .quantum_size(50)
                .participation_range("0-1")
                .build()
                .unwrap(),
        );
        let barrier = Arc::new(DynamicBarrier::new());
        let accounts: Arc<[QuantumAccount]> = Arc::from(vec![QuantumAccount::new(1), QuantumAccount::new(1)]);
        let executor = Arc::new(FixedSliceExecutor {
            accounts: Arc::clone(&accounts),
            slice_cost: 20,
            slices_remaining: vec![AtomicU32::new(5), AtomicU32::new(5)],
            slices_run: AtomicUsize::new(0),
        });

        let results = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for idx in 0..2u64 {
                let config = Arc::clone(&config);
                let barrier = Arc::clone(&barrier);
                let accounts = Arc::clone(&accounts);
                let executor = Arc::clone(&executor);
                let results = &results;
                scope.spawn(move || {
                    let mut driver = VcpuDriver::new(idx, config, barrier, accounts);
                    let reason = driver.run(executor.as_ref());
                    results.lock().unwrap().push(reason);
                });
            }
        });

        let results = results.into_inner().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| *r == ExitReason::Unplugged));
        assert!(barrier.generation() > 0);
    }
}
