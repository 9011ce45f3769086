//! Walk through the basic Region API: typed values, raw allocations,
//! cleanup callbacks and reset.

use memregion::Region;

fn report(stage: &str, region: &Region) {
    println!(
        "{stage}: {} bytes used of {} allocated",
        region.space_used(),
        region.space_allocated()
    );
}

unsafe fn farewell(_elem: *mut u8) {
    println!("cleanup callback ran");
}

fn main() {
    env_logger::init();

    let mut region = Region::new();

    let message = region.create(String::from("lives in the region"));
    println!("message: {message}");

    let numbers = region.create(vec![1u32, 2, 3, 4]);
    numbers.push(5);
    println!("numbers: {numbers:?}");

    let raw = region.allocate_aligned(128);
    println!("raw 128-byte allocation at {:p}", raw.as_ptr());

    unsafe { region.add_cleanup(std::ptr::null_mut(), farewell) };

    report("before reset", &region);
    let freed = region.reset();
    println!("reset released {freed} bytes");
    report("after reset", &region);
}
