//! Multi-threaded integration tests for `DynamicBarrier` and the
//! `VcpuDriver` settle loop built on it.
//!
//! These exercise the barrier the way it actually has to be tested: real
//! OS threads rendezvousing, not a single-threaded stand-in.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use qsync::barrier::DynamicBarrier;

/// P1: every release advances `generation` by exactly one and resets `count`.
#[test]
fn p1_release_advances_generation_and_resets_count() {
    let barrier = Arc::new(DynamicBarrier::with_generation_budget(1000));
    barrier.join();
    barrier.join();

    let threads: Vec<_> = (0..2)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.wait(0))
        })
        .collect();

    for t in threads {
        assert_eq!(t.join().unwrap(), 1);
    }
    assert_eq!(barrier.generation(), 1);
}

/// P3: `current_system_target_time` accumulates exactly the sum of the
/// per-generation budgets that have been released so far.
#[test]
fn p3_system_target_time_is_sum_of_released_generation_budgets() {
    let barrier = Arc::new(DynamicBarrier::with_generation_budget(1000));
    barrier.join();

    for expected_generation in 1..=5u32 {
        let next = barrier.wait(expected_generation - 1);
        assert_eq!(next, expected_generation);
    }

    assert_eq!(barrier.current_system_target_time(), 5 * 1000);
}

/// R1: `join(); leave();` leaves `threshold` unchanged.
#[test]
fn r1_join_then_leave_restores_threshold() {
    let barrier = DynamicBarrier::new();
    barrier.join();
    let before = barrier.threshold();
    barrier.join();
    barrier.leave();
    assert_eq!(barrier.threshold(), before);
}

/// R2: `wait(g)` then immediate `wait(g+1)` from all members advances
/// `generation` by exactly two.
#[test]
fn r2_two_consecutive_waits_from_all_members_advance_generation_by_two() {
    let barrier = Arc::new(DynamicBarrier::new());
    barrier.join();
    barrier.join();
    let start = barrier.generation();

    for round in 0..2 {
        let threads: Vec<_> = (0..2)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || barrier.wait(start + round))
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
    }

    assert_eq!(barrier.generation(), start + 2);
}

/// B1: with one member, each `wait` returns immediately and advances
/// `generation`.
#[test]
fn b1_single_member_wait_returns_immediately() {
    let barrier = DynamicBarrier::new();
    barrier.join();
    let next = barrier.wait(0);
    assert_eq!(next, 1);
    assert_eq!(barrier.generation(), 1);
}

/// B2: with zero members after all have left, `threshold == 0` and
/// `current_system_target_time` is frozen.
#[test]
fn b2_zero_members_freezes_system_target_time() {
    let barrier = DynamicBarrier::with_generation_budget(500);
    barrier.join();
    barrier.wait(0);
    barrier.leave();
    let frozen = barrier.current_system_target_time();
    assert_eq!(barrier.threshold(), 0);

    // No one left to wait; the frontier cannot move without a member.
    thread::sleep(Duration::from_millis(10));
    assert_eq!(barrier.current_system_target_time(), frozen);
}

/// B3: with `respect_deadline` set and a deadline source that reports an
/// already-due deadline, the next generation's budget collapses to zero
/// and the release is still produced.
#[test]
fn b3_due_deadline_collapses_next_generation_budget_to_zero() {
    let barrier = DynamicBarrier::with_generation_budget(1000)
        .with_deadline_respect(true)
        .with_deadline_source(|| 0);
    barrier.join();
    let next = barrier.wait(0);
    assert_eq!(next, 1);
    assert_eq!(barrier.current_generation_budget(), 0);
}

/// Scenario 1: two symmetric vCPUs, Q=1000, IPC=1 each, no I/O. After
/// N=5 releases each side has advanced the barrier by exactly 5*Q.
#[test]
fn scenario_two_symmetric_vcpus_five_releases_reach_5000() {
    let barrier = Arc::new(DynamicBarrier::with_generation_budget(1000));
    barrier.join();
    barrier.join();

    for gen in 0..5u32 {
        let threads: Vec<_> = (0..2)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || barrier.wait(gen))
            })
            .collect();
        for t in threads {
            assert_eq!(t.join().unwrap(), gen + 1);
        }
    }

    assert_eq!(barrier.current_system_target_time(), 5000);
    assert_eq!(barrier.generation(), 5);
}

/// Scenario 2: one vCPU joins late. vCPU0 runs solo through 3
/// generations; at generation 3, vCPU1 joins, and vCPU1's first `wait`
/// only completes once vCPU0 also arrives for generation 4.
#[test]
fn scenario_late_joiner_blocks_until_solo_runner_also_arrives() {
    let barrier = Arc::new(DynamicBarrier::new());
    barrier.join();

    for gen in 0..3u32 {
        assert_eq!(barrier.wait(gen), gen + 1);
    }
    assert_eq!(barrier.generation(), 3);

    barrier.join();
    let late_joiner_done = Arc::new(AtomicU32::new(0));

    let late_barrier = Arc::clone(&barrier);
    let flag = Arc::clone(&late_joiner_done);
    let late = thread::spawn(move || {
        let next = late_barrier.wait(3);
        flag.store(next, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(20));
    assert_eq!(
        late_joiner_done.load(Ordering::SeqCst),
        0,
        "late joiner must not complete before the solo runner also arrives"
    );

    assert_eq!(barrier.wait(3), 4);
    late.join().unwrap();
    assert_eq!(late_joiner_done.load(Ordering::SeqCst), 4);
}

/// Scenario 3: members {A,B,C} with count=2 (A and B arrived). C calls
/// `leave()` instead of arriving; the release must still fire and A, B
/// must proceed.
#[test]
fn scenario_leave_triggers_release_for_remaining_waiters() {
    let barrier = Arc::new(DynamicBarrier::new());
    barrier.join(); // A
    barrier.join(); // B
    barrier.join(); // C

    let a = {
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || barrier.wait(0))
    };
    let b = {
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || barrier.wait(0))
    };

    // Give A and B a chance to register their arrival before C leaves.
    // There is no deadlock risk either way: if C leaves first, the
    // threshold drops to 2 and A/B's own arrivals trigger the release.
    thread::sleep(Duration::from_millis(20));
    barrier.leave(); // C

    assert_eq!(a.join().unwrap(), 1);
    assert_eq!(b.join().unwrap(), 1);
    assert_eq!(barrier.generation(), 1);
    assert_eq!(barrier.threshold(), 2);
}
