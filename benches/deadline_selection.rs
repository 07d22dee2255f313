//! Deadline selection benchmark
//!
//! `select_min_deadline` and the blocked-set bookkeeping run on every pass of
//! the scheduler loop once all children are blocked, so they must stay cheap
//! for registries far larger than any realistic process tree.
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench deadline_selection
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nix::unistd::Pid;
use timewarp::registry::{Deadline, ParentScheduler};

const FAKE_PID_BASE: i32 = i32::MAX - 100_000;

/// Registry with `n` blocked children, every third one without a deadline
fn blocked_registry(n: usize) -> ParentScheduler {
    let mut parent = ParentScheduler::new(libc::SIGURG);
    for i in 0..n {
        let id = parent.register(Pid::from_raw(FAKE_PID_BASE + i as i32));
        parent.mark_blocked(id).unwrap();
        let deadline = match i % 3 {
            0 => Deadline::Forever,
            1 => Deadline::Unknown,
            _ => Deadline::At(((i * 7_919) % 1_000_003) as i128 * 1_000),
        };
        parent.child_mut(id).unwrap().blocked_until = deadline;
    }
    parent
}

fn bench_select_min_deadline(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_min_deadline");
    for size in [8usize, 64, 512, 4096] {
        let parent = blocked_registry(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &parent, |b, parent| {
            b.iter(|| black_box(parent.select_min_deadline()));
        });
    }
    group.finish();
}

fn bench_block_unblock_cycle(c: &mut Criterion) {
    let mut parent = blocked_registry(512);
    let id = parent.id_of(Pid::from_raw(FAKE_PID_BASE + 100)).unwrap();
    c.bench_function("mark_unblocked_then_blocked", |b| {
        b.iter(|| {
            parent.mark_unblocked(black_box(id)).unwrap();
            parent.mark_blocked(black_box(id)).unwrap();
        });
    });
}

criterion_group!(benches, bench_select_min_deadline, bench_block_unblock_cycle);
criterion_main!(benches);
