//! Microbenchmarks for `DynamicBarrier::wait` round-trip latency.
//!
//! Run with: `cargo bench -p qsync -- barrier`

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use qsync::barrier::DynamicBarrier;

/// One `join` + one `wait` round trip per member, for `member_count`
/// threads rendezvousing on a fresh barrier each iteration.
fn bench_wait_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("barrier/wait_round_trip");

    for member_count in [1usize, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(member_count),
            &member_count,
            |b, &member_count| {
                b.iter(|| {
                    let barrier = Arc::new(DynamicBarrier::new());
                    for _ in 0..member_count {
                        barrier.join();
                    }

                    thread::scope(|scope| {
                        for _ in 0..member_count {
                            let barrier = Arc::clone(&barrier);
                            scope.spawn(move || {
                                barrier.wait(0);
                            });
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

/// Ten consecutive releases with two members held for the whole run,
/// the steady-state shape of the settle loop under real load.
fn bench_ten_consecutive_releases(c: &mut Criterion) {
    c.bench_function("barrier/ten_consecutive_releases_two_members", |b| {
        b.iter(|| {
            let barrier = Arc::new(DynamicBarrier::with_generation_budget(1000));
            barrier.join();
            barrier.join();

            thread::scope(|scope| {
                for _ in 0..2 {
                    let barrier = Arc::clone(&barrier);
                    scope.spawn(move || {
                        let mut generation = 0;
                        for _ in 0..10 {
                            generation = barrier.wait(generation);
                        }
                    });
                }
            });
        });
    });
}

criterion_group!(benches, bench_wait_round_trip, bench_ten_consecutive_releases);
criterion_main!(benches);
