//! Concurrency scenarios driving one region from many threads at once.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use memregion::Region;

const THREADS: usize = 8;
const ALLOCS_PER_THREAD: usize = 10_000;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

#[test]
fn parallel_allocation_accounts_exactly_and_never_overlaps() {
    let region = Region::new();

    let per_thread: Vec<(u64, Vec<(usize, usize, u8)>)> = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for thread_index in 0..THREADS {
            let region = &region;
            handles.push(scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(thread_index as u64);
                let fill = 0x10 + thread_index as u8;
                let mut rounded_total = 0u64;
                let mut allocations = Vec::with_capacity(ALLOCS_PER_THREAD);
                for _ in 0..ALLOCS_PER_THREAD {
                    let n = rng.gen_range(1..=256);
                    let ptr = region.allocate_aligned(n);
                    assert_eq!(ptr.as_ptr() as usize % 8, 0);
                    unsafe { ptr.as_ptr().write_bytes(fill, n) };
                    rounded_total += align8(n) as u64;
                    allocations.push((ptr.as_ptr() as usize, n, fill));
                }
                (rounded_total, allocations)
            }));
        }
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    let expected: u64 = per_thread.iter().map(|(total, _)| *total).sum();
    assert_eq!(region.space_used(), expected);
    assert!(region.space_allocated() >= region.space_used());

    // Nothing overlapped: every allocation still carries its thread's fill
    // pattern after all threads have finished.
    for (_, allocations) in &per_thread {
        for &(addr, len, fill) in allocations {
            let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
            assert!(bytes.iter().all(|&byte| byte == fill));
        }
    }
}

#[test]
fn cleanups_registered_from_many_threads_all_run_once() {
    static RUNS: AtomicUsize = AtomicUsize::new(0);

    unsafe fn bump(_elem: *mut u8) {
        RUNS.fetch_add(1, Ordering::SeqCst);
    }

    let mut region = Region::new();
    std::thread::scope(|scope| {
        for _ in 0..4 {
            let region = &region;
            scope.spawn(move || {
                for _ in 0..500 {
                    unsafe { region.add_cleanup(std::ptr::null_mut(), bump) };
                }
            });
        }
    });

    region.reset();
    assert_eq!(RUNS.load(Ordering::SeqCst), 2000);

    // A second cycle must not re-run anything.
    region.reset();
    assert_eq!(RUNS.load(Ordering::SeqCst), 2000);
}

#[test]
fn typed_values_from_many_threads_drop_exactly_once() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Token(u64);

    impl Drop for Token {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    let region = Region::new();
    std::thread::scope(|scope| {
        for thread_index in 0..4u64 {
            let region = &region;
            scope.spawn(move || {
                for i in 0..250 {
                    let token = region.create(Token(thread_index * 1000 + i));
                    assert_eq!(token.0, thread_index * 1000 + i);
                }
            });
        }
    });

    drop(region);
    assert_eq!(DROPS.load(Ordering::SeqCst), 1000);
}
