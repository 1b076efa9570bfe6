//! Periodic barrier wall-clock reporter.
//!
//! Every `interval`, logs the barrier's generation and accumulated wait
//! time so an operator watching the demo can see the barrier's progress
//! without waiting for the run to finish.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use qsync::barrier::DynamicBarrier;

/// Runs the periodic report loop until `stop` is set. Intended to be
/// spawned on its own thread and joined after the vCPU threads exit.
pub fn run(barrier: Arc<DynamicBarrier>, interval: Duration, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(interval);
        if stop.load(Ordering::Relaxed) {
            break;
        }
        tracing::info!(
            generation = barrier.generation(),
            system_target_time = barrier.current_system_target_time(),
            total_wait_time = ?barrier.total_wait_time(),
            normalized_wait_time = ?barrier.normalized_wait_time(),
            "barrier progress"
        );
    }
}
