//! Platform page memory for the region allocator.
//!
//! The default block source is the process heap, but regions that hold many
//! megabytes are better served straight from the kernel:
//!
//! [`mmap`](https://man7.org/linux/man-pages/man2/mmap.2.html) on Unix,
//! [`VirtualAlloc`](https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc)
//! on Windows.
//!
//! [`alloc_pages`] and [`dealloc_pages`] have the exact signatures of the
//! [`AllocationPolicy`](crate::AllocationPolicy) block hooks, so installing a
//! page-granular block source is one builder call:
//!
//! ```
//! use memregion::{kernel, PolicyBuilder, Region};
//!
//! let policy = PolicyBuilder::new()
//!     .start_block_size(64 * 1024)
//!     .max_block_size(1024 * 1024)
//!     .block_allocator(kernel::alloc_pages, kernel::dealloc_pages)
//!     .build()
//!     .unwrap();
//! let region = Region::with_policy(policy);
//! # drop(region);
//! ```

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::policy::BlockMem;
use crate::utils::align_up;

/// Virtual memory page size of the computer, usually 4096. This would be a
/// constant if we knew the value at compile time; instead it is probed once
/// and cached.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Carrier for the platform-dependent memory syscalls. The rest of the crate
/// has nothing to do with the concrete APIs offered by each kernel.
struct Kernel;

trait PlatformMemory {
    /// Request a memory region of `len` bytes, or `None` if the underlying
    /// syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Return the region of `len` bytes starting at `addr` to the kernel.
    unsafe fn return_memory(addr: *mut u8, len: usize);

    /// The virtual memory page size of the computer in bytes.
    unsafe fn probe_page_size() -> usize;
}

/// The platform page size in bytes. Probed on first use, then cached.
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let probed = unsafe { Kernel::probe_page_size() };
    PAGE_SIZE.store(probed, Ordering::Relaxed);
    probed
}

/// Page-granular block allocator, suitable as an
/// [`AllocationPolicy::block_alloc`](crate::AllocationPolicy::block_alloc)
/// hook. The returned size is `requested` rounded up to whole pages; the
/// region treats the slack as usable block capacity.
pub fn alloc_pages(requested: usize) -> BlockMem {
    let size = align_up(requested, page_size());
    match unsafe { Kernel::request_memory(size) } {
        Some(ptr) => BlockMem {
            ptr: ptr.as_ptr(),
            size,
        },
        None => {
            log::error!("page allocation of {size} bytes was refused by the kernel");
            let layout =
                Layout::from_size_align(size, page_size()).unwrap_or(Layout::new::<u64>());
            std::alloc::handle_alloc_error(layout)
        }
    }
}

/// Counterpart of [`alloc_pages`], suitable as an
/// [`AllocationPolicy::block_dealloc`](crate::AllocationPolicy::block_dealloc)
/// hook.
pub fn dealloc_pages(ptr: *mut u8, size: usize) {
    unsafe { Kernel::return_memory(ptr, size) }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::os::raw::{c_int, c_void};
    use std::ptr::NonNull;

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => Some(NonNull::new_unchecked(addr).cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            unsafe {
                munmap(addr as *mut c_void, len as size_t);
            }
        }

        unsafe fn probe_page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::{Kernel, PlatformMemory};

    use std::mem::MaybeUninit;
    use std::os::raw::c_void;
    use std::ptr::NonNull;

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }

        unsafe fn probe_page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        let size = page_size();
        assert!(size >= 512);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn alloc_pages_rounds_up_and_is_writable() {
        let mem = alloc_pages(100);
        assert_eq!(mem.size, page_size());
        assert_eq!(mem.ptr as usize % 8, 0);

        unsafe {
            mem.ptr.write_bytes(0xab, mem.size);
            assert_eq!(*mem.ptr, 0xab);
            assert_eq!(*mem.ptr.add(mem.size - 1), 0xab);
        }

        dealloc_pages(mem.ptr, mem.size);
    }

    #[test]
    fn multi_page_requests_stay_page_granular() {
        let mem = alloc_pages(page_size() + 1);
        assert_eq!(mem.size, 2 * page_size());
        dealloc_pages(mem.ptr, mem.size);
    }
}
