//! Eight threads hammer one region concurrently; each thread transparently
//! gets its own shard, so there is no contention on the hot path.

use memregion::Region;

fn main() {
    env_logger::init();

    let region = Region::new();
    std::thread::scope(|scope| {
        for thread_index in 0..8usize {
            let region = &region;
            scope.spawn(move || {
                for i in 0..10_000usize {
                    let n = 1 + (thread_index * 31 + i * 7) % 128;
                    region.allocate_aligned(n);
                }
            });
        }
    });

    println!(
        "used {} of {} allocated bytes",
        region.space_used(),
        region.space_allocated()
    );
}
