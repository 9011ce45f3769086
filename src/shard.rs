use std::alloc::{self, Layout};
use std::cell::Cell;
use std::cmp;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::block::{Block, BLOCK_HEADER_SIZE};
use crate::cleanup::{CleanupRecord, CLEANUP_RECORD_SIZE, MIN_CLEANUP_SLOTS};
use crate::policy::{AllocationPolicy, BlockDeallocFn, BlockMem};
use crate::utils::align8;

/// Size of the in-block shard structure, kept 8-aligned because the shard is
/// self-hosted right behind its first block's header and allocations start
/// immediately after it.
pub(crate) const SHARD_SIZE: usize = align8(mem::size_of::<Shard>());

/// Obtains backing memory for one block.
///
/// Doubles the previous block size up to the policy's cap (or starts at the
/// policy's start size), then raises the result so `min_bytes` of payload fit
/// behind the header. Memory comes from the policy's `block_alloc` hook when
/// one is installed, otherwise from the system heap.
pub(crate) fn allocate_block(
    policy: Option<&AllocationPolicy>,
    last_size: usize,
    min_bytes: usize,
) -> BlockMem {
    let default_policy;
    let policy = match policy {
        Some(policy) => policy,
        None => {
            default_policy = AllocationPolicy::default();
            &default_policy
        }
    };

    let mut size = if last_size != 0 {
        cmp::min(last_size.saturating_mul(2), policy.max_block_size)
    } else {
        policy.start_block_size
    };
    // The one sizing computation that can overflow.
    assert!(
        min_bytes <= usize::MAX - BLOCK_HEADER_SIZE,
        "arena block size arithmetic overflow"
    );
    size = cmp::max(size, BLOCK_HEADER_SIZE + min_bytes);

    log::debug!("installing {size}-byte arena block");

    match policy.block_alloc {
        Some(block_alloc) => block_alloc(size),
        None => {
            let layout = match Layout::from_size_align(size, 8) {
                Ok(layout) => layout,
                Err(_) => {
                    log::error!("arena block of {size} bytes exceeds the address space");
                    alloc::handle_alloc_error(Layout::new::<u64>())
                }
            };
            let ptr = unsafe { alloc::alloc(layout) };
            if ptr.is_null() {
                log::error!("arena block allocation of {size} bytes failed");
                alloc::handle_alloc_error(layout);
            }
            BlockMem { ptr, size }
        }
    }
}

/// Routes a block back to whichever allocator produced it and accounts for
/// the released bytes.
pub(crate) struct Deallocator {
    hook: Option<BlockDeallocFn>,
}

impl Deallocator {
    pub fn new(policy: Option<&AllocationPolicy>) -> Self {
        Self {
            hook: policy.and_then(|policy| policy.block_dealloc),
        }
    }

    /// **SAFETY**: `mem` must be a block previously produced for this
    /// region's policy and not yet released.
    pub unsafe fn deallocate(&self, mem: BlockMem, freed: &mut u64) {
        match self.hook {
            Some(dealloc) => dealloc(mem.ptr, mem.size),
            None => unsafe {
                alloc::dealloc(mem.ptr, Layout::from_size_align_unchecked(mem.size, 8));
            },
        }
        *freed += mem.size as u64;
    }
}

/// A single-owner bump arena chained from one or more [`Block`]s.
///
/// The shard structure lives inside its own first block, right behind the
/// block header. All bump state is strictly single-writer: only the owning
/// thread ever touches `head`, `ptr`, `limit` and `space_used`. Other
/// threads are limited to `owner` (written once before the shard is
/// published), `space_allocated` and `next`.
pub(crate) struct Shard {
    /// Identity token of the thread this shard serves.
    owner: usize,
    /// Current (newest) block.
    head: Cell<NonNull<Block>>,
    /// Forward bump pointer.
    ptr: Cell<*mut u8>,
    /// Lower bound of the head block's cleanup region; bumpable space ends
    /// here. Invariant: `ptr <= limit`.
    limit: Cell<*mut u8>,
    /// Total bytes across all blocks ever attached to this shard. Written
    /// only by the owner, read by anyone.
    space_allocated: AtomicU64,
    /// Bytes consumed in retired (non-head) blocks, frozen as each one was
    /// retired.
    space_used: Cell<u64>,
    /// Next shard in the region's lock-free list.
    next: AtomicPtr<Shard>,
}

impl Shard {
    /// Places a new shard inside `mem`, which becomes its first block.
    ///
    /// **SAFETY**: `mem` must be 8-byte aligned, valid for `mem.size` bytes,
    /// and large enough for a block header plus the shard structure.
    pub unsafe fn new_in(mem: BlockMem, owner: usize) -> NonNull<Shard> {
        debug_assert!(mem.size >= BLOCK_HEADER_SIZE + SHARD_SIZE);
        unsafe {
            let block = Block::init(mem.ptr, mem.size, None);
            let shard = block.as_ref().at(BLOCK_HEADER_SIZE).cast::<Shard>();
            shard.write(Shard {
                owner,
                head: Cell::new(block),
                ptr: Cell::new(block.as_ref().at(BLOCK_HEADER_SIZE + SHARD_SIZE)),
                limit: Cell::new(block.as_ref().aligned_limit()),
                space_allocated: AtomicU64::new(mem.size as u64),
                space_used: Cell::new(0),
                next: AtomicPtr::new(std::ptr::null_mut()),
            });
            NonNull::new_unchecked(shard)
        }
    }

    #[inline]
    pub fn owner(&self) -> usize {
        self.owner
    }

    #[inline]
    pub fn next_shard(&self) -> *mut Shard {
        self.next.load(Ordering::Acquire)
    }

    /// Only called between creating a shard and publishing it; the release
    /// ordering of the publishing compare-and-swap makes this visible.
    #[inline]
    pub fn set_next(&self, next: *mut Shard) {
        self.next.store(next, Ordering::Relaxed);
    }

    #[inline]
    fn free_space(&self) -> usize {
        self.limit.get() as usize - self.ptr.get() as usize
    }

    /// Bump-allocates `n` bytes rounded up to 8, growing the block chain if
    /// the head is exhausted.
    #[inline]
    pub fn allocate_aligned(&self, n: usize, policy: Option<&AllocationPolicy>) -> NonNull<u8> {
        let n = align8(n);
        if n <= self.free_space() {
            let ptr = self.ptr.get();
            self.ptr.set(unsafe { ptr.add(n) });
            unsafe { NonNull::new_unchecked(ptr) }
        } else {
            self.grow_and_allocate(n, policy)
        }
    }

    #[cold]
    fn grow_and_allocate(&self, n: usize, policy: Option<&AllocationPolicy>) -> NonNull<u8> {
        self.install_block(n, policy);
        self.allocate_aligned(n, policy)
    }

    /// Non-growing variant: succeeds only if the current head has room.
    /// Never adds a block.
    pub fn maybe_allocate_aligned(&self, n: usize) -> Option<NonNull<u8>> {
        let n = align8(n);
        if n <= self.free_space() {
            let ptr = self.ptr.get();
            self.ptr.set(unsafe { ptr.add(n) });
            Some(unsafe { NonNull::new_unchecked(ptr) })
        } else {
            None
        }
    }

    /// Like [`allocate_aligned`](Self::allocate_aligned) but also reserves
    /// one cleanup slot from the top of the block. The returned slot is
    /// uninitialized; the caller must write both of its fields.
    #[inline]
    pub fn allocate_aligned_with_cleanup(
        &self,
        n: usize,
        policy: Option<&AllocationPolicy>,
    ) -> (NonNull<u8>, NonNull<CleanupRecord>) {
        let n = align8(n);
        let free = self.free_space();
        if n <= free && CLEANUP_RECORD_SIZE <= free - n {
            let ptr = self.ptr.get();
            self.ptr.set(unsafe { ptr.add(n) });
            let slot = unsafe { self.limit.get().sub(CLEANUP_RECORD_SIZE) };
            self.limit.set(slot);
            unsafe { (NonNull::new_unchecked(ptr), NonNull::new_unchecked(slot.cast())) }
        } else {
            self.grow_and_allocate_with_cleanup(n, policy)
        }
    }

    #[cold]
    fn grow_and_allocate_with_cleanup(
        &self,
        n: usize,
        policy: Option<&AllocationPolicy>,
    ) -> (NonNull<u8>, NonNull<CleanupRecord>) {
        // Size the replacement so a handful of further records fit without
        // another block.
        let min_bytes = n
            .checked_add(CLEANUP_RECORD_SIZE * MIN_CLEANUP_SLOTS)
            .unwrap_or(usize::MAX);
        self.install_block(min_bytes, policy);
        self.allocate_aligned_with_cleanup(n, policy)
    }

    /// Registers `cleanup(elem)` to run at the region's next reset/destroy.
    pub fn add_cleanup(
        &self,
        elem: *mut u8,
        cleanup: unsafe fn(*mut u8),
        policy: Option<&AllocationPolicy>,
    ) {
        let (_, slot) = self.allocate_aligned_with_cleanup(0, policy);
        unsafe { slot.as_ptr().write(CleanupRecord { elem, cleanup }) };
    }

    /// Retires the current head and installs a freshly allocated block with
    /// room for at least `min_bytes`.
    fn install_block(&self, min_bytes: usize, policy: Option<&AllocationPolicy>) {
        let head = self.head.get();
        let head_ref = unsafe { head.as_ref() };

        // Freeze the retired block's cleanup boundary.
        head_ref.cleanup_tail.set(self.limit.get().cast());
        self.space_used
            .set(self.space_used.get() + (self.ptr.get() as u64 - head_ref.payload() as u64));

        let mem = allocate_block(policy, head_ref.size, min_bytes);
        // The counter is owned by this shard and only ever read by other
        // threads, so a plain load+store is enough; an RMW would demand
        // exclusive cacheline access for nothing.
        let relaxed = Ordering::Relaxed;
        self.space_allocated
            .store(self.space_allocated.load(relaxed) + mem.size as u64, relaxed);

        let block = unsafe { Block::init(mem.ptr, mem.size, Some(head)) };
        let block_ref = unsafe { block.as_ref() };
        self.head.set(block);
        self.ptr.set(block_ref.payload());
        self.limit.set(block_ref.aligned_limit());
    }

    /// Invokes every registered cleanup exactly once: newest block first,
    /// reverse registration order within each block. The bump state is not
    /// reset; callers discard the blocks afterwards.
    pub fn run_cleanup(&self) {
        let head = self.head.get();
        unsafe { head.as_ref().cleanup_tail.set(self.limit.get().cast()) };

        let mut block = Some(head);
        while let Some(current) = block {
            let current = unsafe { current.as_ref() };
            let limit = current.aligned_limit().cast::<CleanupRecord>();
            let mut record = current.cleanup_tail.get();
            while record < limit {
                unsafe {
                    let CleanupRecord { elem, cleanup } = record.read();
                    cleanup(elem);
                    record = record.add(1);
                }
            }
            block = current.prev;
        }
    }

    /// Releases every block except the oldest and returns the oldest for the
    /// caller to decide its fate (a user-owned initial block must not be
    /// freed here).
    ///
    /// **SAFETY**: the shard must not be used again afterwards except to
    /// release the returned memory; the shard structure itself lives inside
    /// that memory.
    pub unsafe fn free(&self, deallocator: &Deallocator, freed: &mut u64) -> BlockMem {
        unsafe {
            let mut block = self.head.get();
            let mut mem = BlockMem {
                ptr: block.as_ptr().cast(),
                size: block.as_ref().size,
            };
            while let Some(prev) = block.as_ref().prev {
                // Advance before releasing; the link lives in the memory
                // being released.
                block = prev;
                deallocator.deallocate(mem, freed);
                mem = BlockMem {
                    ptr: block.as_ptr().cast(),
                    size: block.as_ref().size,
                };
            }
            mem
        }
    }

    /// Total bytes of backing memory this shard has ever attached.
    pub fn space_allocated(&self) -> u64 {
        self.space_allocated.load(Ordering::Relaxed)
    }

    /// Bytes handed out to callers. The self-hosting overhead of the shard
    /// structure is subtracted so users see only their own bytes.
    pub fn space_used(&self) -> u64 {
        let head = unsafe { self.head.get().as_ref() };
        (self.ptr.get() as u64 - head.payload() as u64) + self.space_used.get()
            - SHARD_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyBuilder;
    use std::sync::atomic::AtomicUsize;

    fn new_shard(policy: Option<&AllocationPolicy>) -> NonNull<Shard> {
        let mem = allocate_block(policy, 0, SHARD_SIZE);
        unsafe { Shard::new_in(mem, 1) }
    }

    unsafe fn destroy(shard: NonNull<Shard>, policy: Option<&AllocationPolicy>) -> u64 {
        let deallocator = Deallocator::new(policy);
        let mut freed = 0;
        unsafe {
            let mem = shard.as_ref().free(&deallocator, &mut freed);
            deallocator.deallocate(mem, &mut freed);
        }
        freed
    }

    static CLEANUP_SEQ: AtomicUsize = AtomicUsize::new(0);

    unsafe fn stamp_order(elem: *mut u8) {
        unsafe { *elem.cast::<usize>() = CLEANUP_SEQ.fetch_add(1, Ordering::SeqCst) };
    }

    unsafe fn count_invocation(elem: *mut u8) {
        unsafe { &*(elem as *const AtomicUsize) }.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn bump_addresses_increase_by_aligned_size() {
        let shard = new_shard(None);
        let shard_ref = unsafe { shard.as_ref() };

        let a = shard_ref.allocate_aligned(13, None).as_ptr() as usize;
        let b = shard_ref.allocate_aligned(13, None).as_ptr() as usize;
        let c = shard_ref.allocate_aligned(8, None).as_ptr() as usize;

        assert_eq!(a % 8, 0);
        assert_eq!(b, a + 16);
        assert_eq!(c, b + 16);

        unsafe { destroy(shard, None) };
    }

    #[test]
    fn space_used_excludes_self_hosting_overhead() {
        let shard = new_shard(None);
        let shard_ref = unsafe { shard.as_ref() };

        assert_eq!(shard_ref.space_used(), 0);
        shard_ref.allocate_aligned(100, None);
        assert_eq!(shard_ref.space_used(), 104);

        unsafe { destroy(shard, None) };
    }

    #[test]
    fn maybe_allocate_never_grows() {
        let shard = new_shard(None);
        let shard_ref = unsafe { shard.as_ref() };
        let before = shard_ref.space_allocated();

        // Drain the first block, then ask for more than fits.
        assert!(shard_ref.maybe_allocate_aligned(64).is_some());
        assert!(shard_ref.maybe_allocate_aligned(4096).is_none());
        assert_eq!(shard_ref.space_allocated(), before);

        unsafe { destroy(shard, None) };
    }

    #[test]
    fn block_sizes_double_up_to_the_cap() {
        let policy = PolicyBuilder::new()
            .start_block_size(256)
            .max_block_size(4096)
            .build()
            .unwrap();
        let shard = new_shard(Some(&policy));
        let shard_ref = unsafe { shard.as_ref() };

        let mut sizes = vec![shard_ref.space_allocated()];
        for _ in 0..40 {
            shard_ref.allocate_aligned(200, Some(&policy));
            let total = shard_ref.space_allocated();
            if total != *sizes.last().unwrap() {
                sizes.push(total);
            }
        }

        let deltas: Vec<u64> = sizes.windows(2).map(|pair| pair[1] - pair[0]).collect();
        assert_eq!(&deltas[..4], &[512, 1024, 2048, 4096]);
        // Once the cap is reached, every further block stays there.
        assert!(deltas[4..].iter().all(|&delta| delta == 4096));

        unsafe { destroy(shard, Some(&policy)) };
    }

    #[test]
    fn cleanup_runs_in_reverse_registration_order() {
        let shard = new_shard(None);
        let shard_ref = unsafe { shard.as_ref() };

        let mut slots = [0usize; 3];
        for slot in slots.iter_mut() {
            shard_ref.add_cleanup((slot as *mut usize).cast(), stamp_order, None);
        }
        shard_ref.run_cleanup();

        assert!(slots[2] < slots[1]);
        assert!(slots[1] < slots[0]);

        unsafe { destroy(shard, None) };
    }

    #[test]
    fn cleanup_covers_retired_blocks_newest_first() {
        let policy = PolicyBuilder::new()
            .start_block_size(256)
            .max_block_size(256)
            .build()
            .unwrap();
        let shard = new_shard(Some(&policy));
        let shard_ref = unsafe { shard.as_ref() };

        let mut first = 0usize;
        let mut second = 0usize;
        shard_ref.add_cleanup((&mut first as *mut usize).cast(), stamp_order, Some(&policy));
        // Force the shard onto a new block, then register there.
        shard_ref.allocate_aligned(200, Some(&policy));
        shard_ref.add_cleanup((&mut second as *mut usize).cast(), stamp_order, Some(&policy));

        shard_ref.run_cleanup();
        assert!(second < first);

        unsafe { destroy(shard, Some(&policy)) };
    }

    #[test]
    fn caller_written_cleanup_slot_is_invoked() {
        let shard = new_shard(None);
        let shard_ref = unsafe { shard.as_ref() };

        let counter = AtomicUsize::new(0);
        let (ptr, slot) = shard_ref.allocate_aligned_with_cleanup(32, None);
        assert_eq!(ptr.as_ptr() as usize % 8, 0);
        unsafe {
            slot.as_ptr().write(CleanupRecord {
                elem: (&counter as *const AtomicUsize as *mut u8),
                cleanup: count_invocation,
            });
        }

        shard_ref.run_cleanup();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        unsafe { destroy(shard, None) };
    }

    #[test]
    fn free_returns_the_oldest_block() {
        let shard = new_shard(None);
        let shard_ref = unsafe { shard.as_ref() };
        let base = shard.as_ptr() as usize - BLOCK_HEADER_SIZE;

        // Grow a few times so there is something to free.
        for _ in 0..8 {
            shard_ref.allocate_aligned(512, None);
        }
        let total = shard_ref.space_allocated();

        let deallocator = Deallocator::new(None);
        let mut freed = 0;
        let mem = unsafe { shard_ref.free(&deallocator, &mut freed) };

        assert_eq!(mem.ptr as usize, base);
        assert_eq!(freed + mem.size as u64, total);

        unsafe { deallocator.deallocate(mem, &mut freed) };
        assert_eq!(freed, total);
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn absurd_requests_hit_the_sizing_assert() {
        let shard = new_shard(None);
        unsafe { shard.as_ref() }.allocate_aligned(usize::MAX - 8, None);
    }
}
