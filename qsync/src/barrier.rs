//! Generation-numbered polling barrier with variable membership.
//!
//! Waits are spin-polling only — no condition variables, no parking.
//! Quanta are short enough (often sub-microsecond of host time) that the
//! latency of parking and unparking a thread would dominate the wait
//! itself, so [`DynamicBarrier::wait`] busy-spins on an atomic generation
//! counter instead.
//!
//! Membership (`threshold`) and the per-generation budget bookkeeping
//! (`count`, `current_generation_budget`) are serialized by a fair ticket
//! lock; `generation` itself is a lock-free atomic so spinners never touch
//! the lock.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::histogram::TimeHistogram;

/// A fair ticket lock guarding the barrier's non-atomic fields.
///
/// Spinning for a ticket to be served happens outside any lock — this is
/// the same discipline the barrier itself uses for `generation`.
struct TicketLock<T> {
    next_ticket: AtomicU64,
    now_serving: AtomicU64,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever granted through `lock()`, which
// hands out exactly one guard at a time by ticket order.
unsafe impl<T: Send> Sync for TicketLock<T> {}

struct TicketLockGuard<'a, T> {
    lock: &'a TicketLock<T>,
}

impl<T> std::ops::Deref for TicketLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> std::ops::DerefMut for TicketLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for TicketLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.now_serving.fetch_add(1, Ordering::Release);
    }
}

impl<T> TicketLock<T> {
    fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU64::new(0),
            now_serving: AtomicU64::new(0),
            data: UnsafeCell::new(data),
        }
    }

    fn lock(&self) -> TicketLockGuard<'_, T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            std::hint::spin_loop();
        }
        TicketLockGuard { lock: self }
    }
}

/// Fields serialized by the barrier's ticket lock.
struct BarrierState {
    threshold: u64,
    count: u64,
    current_generation_budget: u64,
    current_system_target_time: u64,
}

/// Generation-numbered barrier over a variable-membership set of threads.
///
/// `join`/`leave`/`wait` are the only operations. A release happens exactly
/// once per generation, performed by whichever caller's arrival (via
/// `wait`) or departure (via `leave`) makes `count == threshold`.
pub struct DynamicBarrier {
    state: TicketLock<BarrierState>,
    generation: AtomicU32,
    respect_deadline: bool,
    deadline_query_threshold: u64,
    /// Optional single-slot plugin callback returning the soonest
    /// guest-timer deadline. Unset means "no deadline", i.e. always use
    /// the full quantum.
    deadline_source: Option<Box<dyn Fn() -> u64 + Send + Sync>>,
    total_wait_time_ns: AtomicU64,
    histograms: TicketLock<Vec<TimeHistogram>>,
}

impl Default for DynamicBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicBarrier {
    /// Creates an inactive barrier (`threshold == 0`) with no deadline
    /// respect and a zero starting generation.
    pub fn new() -> Self {
        Self::with_generation_budget(0)
    }

    /// Creates an inactive barrier whose first generation consumes
    /// `generation_budget` units of virtual time on release.
    pub fn with_generation_budget(generation_budget: u64) -> Self {
        Self {
            state: TicketLock::new(BarrierState {
                threshold: 0,
                count: 0,
                current_generation_budget: generation_budget,
                current_system_target_time: 0,
            }),
            generation: AtomicU32::new(0),
            respect_deadline: false,
            deadline_query_threshold: crate::config::DEADLINE_QUERY_THRESHOLD,
            deadline_source: None,
            total_wait_time_ns: AtomicU64::new(0),
            histograms: TicketLock::new(Vec::new()),
        }
    }

    /// Enables deadline-respect: on release, if `current_generation_budget`
    /// is at least `deadline_query_threshold`, the next generation's budget
    /// is shrunk to the nearest guest-timer deadline reported by the
    /// callback set via [`DynamicBarrier::with_deadline_source`].
    pub fn with_deadline_respect(mut self, enabled: bool) -> Self {
        self.respect_deadline = enabled;
        self
    }

    /// Sets the single-slot plugin callback used to query the soonest
    /// guest-timer deadline. Has no effect unless deadline-respect is also
    /// enabled.
    pub fn with_deadline_source(mut self, source: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.deadline_source = Some(Box::new(source));
        self
    }

    /// The barrier's current generation. Safe to read from any thread
    /// without holding the lock — this is the atomic spinners poll.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// The virtual-time frontier: cumulative sum of past generations'
    /// budgets.
    pub fn current_system_target_time(&self) -> u64 {
        self.state.lock().current_system_target_time
    }

    /// The budget being consumed by the current (in-progress) generation.
    pub fn current_generation_budget(&self) -> u64 {
        self.state.lock().current_generation_budget
    }

    /// Current membership count.
    pub fn threshold(&self) -> u64 {
        self.state.lock().threshold
    }

    /// Total wall-clock time spent inside releases, summed across all
    /// generations so far.
    pub fn total_wait_time(&self) -> Duration {
        Duration::from_nanos(self.total_wait_time_ns.load(Ordering::Relaxed))
    }

    /// Average wall-clock cost per release so far (`total_wait_time /
    /// generation`), or `None` before the first release.
    pub fn normalized_wait_time(&self) -> Option<Duration> {
        let generation = self.generation();
        if generation == 0 {
            return None;
        }
        Some(self.total_wait_time() / generation)
    }

    /// Admits a new member. The caller must not already be counted in the
    /// current `count`.
    ///
    /// Returns the generation and virtual-time frontier observed at join
    /// time, so the caller can seed its own account before its first
    /// `wait`.
    pub fn join(&self) -> (u32, u64) {
        let mut state = self.state.lock();
        state.threshold += 1;
        drop(state);
        (self.generation(), self.current_system_target_time())
    }

    /// Removes a member.
    ///
    /// # Panics
    ///
    /// Calling `leave` from a thread with an outstanding `wait` is a bug in
    /// the caller; this cannot be detected here and is documented, not
    /// enforced.
    pub fn leave(&self) {
        let mut state = self.state.lock();
        assert!(state.threshold > 0, "leave() called on an empty barrier");
        state.threshold -= 1;
        if state.count == state.threshold && state.count > 0 {
            // The departing member's threshold decrement just made every
            // remaining arriver's presence sufficient; nobody else is
            // going to notice, so this caller performs the release.
            self.release(&mut state);
        }
    }

    /// Enters the critical section, waits for all current members to
    /// arrive, and returns the next generation.
    ///
    /// # Panics
    ///
    /// Panics if `my_generation` does not match the barrier's generation at
    /// the time of the call — this indicates the caller's account fell out
    /// of sync with the barrier, a translator-level bug.
    pub fn wait(&self, my_generation: u32) -> u32 {
        let start = std::time::Instant::now();
        let mut state = self.state.lock();
        assert_eq!(
            my_generation,
            self.generation(),
            "wait() called with a stale generation"
        );
        state.count += 1;
        if state.count == state.threshold {
            self.release(&mut state);
            drop(state);
            self.record_wait(start.elapsed());
            return my_generation + 1;
        }
        drop(state);

        while self.generation() == my_generation {
            std::hint::spin_loop();
        }
        self.record_wait(start.elapsed());
        my_generation + 1
    }

    /// Performs the release procedure. Caller must hold `state`'s lock.
    fn release(&self, state: &mut BarrierState) {
        state.current_system_target_time += state.current_generation_budget;

        let mut next_budget = state.current_generation_budget;
        if self.respect_deadline && state.current_generation_budget >= self.deadline_query_threshold {
            if let Some(deadline) = self.query_soonest_deadline() {
                next_budget = next_budget.min(deadline);
            }
        }
        state.current_generation_budget = next_budget;

        state.count = 0;
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Queries the nearest guest-timer deadline through the registered
    /// plugin callback, if any.
    fn query_soonest_deadline(&self) -> Option<u64> {
        self.deadline_source.as_ref().map(|f| f())
    }

    fn record_wait(&self, elapsed: Duration) {
        self.total_wait_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Registers a per-vCPU histogram slot, returning its index. Used by
    /// the driver to record per-quantum wall-clock cost.
    pub fn register_histogram(&self, histogram: TimeHistogram) -> usize {
        let mut histograms = self.histograms.lock();
        histograms.push(histogram);
        histograms.len() - 1
    }

    /// Records one wall-clock observation into vCPU `index`'s histogram.
    pub fn observe(&self, index: usize, nanos: u64) {
        let mut histograms = self.histograms.lock();
        if let Some(h) = histograms.get_mut(index) {
            h.add_data_point(nanos);
        }
    }

    /// Renders the textual dump of vCPU `index`'s histogram, if registered.
    pub fn render_histogram(&self, index: usize) -> Option<String> {
        self.histograms.lock().get(index).map(TimeHistogram::render)
    }
}
