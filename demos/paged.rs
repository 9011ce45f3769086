//! Drive a region whose blocks come straight from the kernel's page
//! allocator instead of the process heap. Run with `RUST_LOG=debug` to watch
//! the blocks being installed.

use memregion::{kernel, PolicyBuilder, Region};

fn main() {
    env_logger::init();

    let policy = PolicyBuilder::new()
        .start_block_size(64 * 1024)
        .max_block_size(4 * 1024 * 1024)
        .block_allocator(kernel::alloc_pages, kernel::dealloc_pages)
        .build()
        .expect("valid policy");

    let mut region = Region::with_policy(policy);
    for i in 0..100_000u64 {
        region.create(i);
    }

    println!(
        "page size {}, used {} of {} allocated bytes",
        kernel::page_size(),
        region.space_used(),
        region.space_allocated()
    );
    let freed = region.reset();
    println!("reset released {freed} bytes back to the kernel");
}
