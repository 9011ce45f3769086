use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::block::BLOCK_HEADER_SIZE;
use crate::cache;
use crate::cleanup::{drop_value, CleanupRecord};
use crate::policy::{AllocationPolicy, BlockMem, POLICY_SIZE};
use crate::shard::{allocate_block, Deallocator, Shard, SHARD_SIZE};

/// Low bit of `tag_and_id`: route every allocation through the metrics
/// collector.
const RECORD_ALLOCS_BIT: u64 = 1;
/// Low bit of `policy_word`: the initial block is borrowed from the caller
/// and must never be deallocated.
const USER_OWNED_BIT: usize = 1;

/// The thread-safe region (bump) allocator.
///
/// A region backs the lifetime of many small heterogeneous objects that
/// share a single owner: callers allocate raw, 8-byte-aligned memory and may
/// register one destructor callback per allocation. Nothing is ever freed
/// individually; [`reset`](Self::reset) or drop runs every registered
/// cleanup exactly once and then releases the storage wholesale.
///
/// Internally the region keeps one bump shard per allocating thread on a
/// lock-free list, so parallel threads allocate without contention:
///
/// ```text
/// +----------------------------------------------------------+
/// |  Region   shards_head                                    |
/// +--------------|-------------------------------------------+
///                v
///        +---------------+        +---------------+
///        | Shard (thr B) | -next> | Shard (thr A) |
///        |  block <- block        |  block        |
///        +---------------+        +---------------+
/// ```
///
/// `allocate_aligned`, `allocate_aligned_with_cleanup`, `add_cleanup` and
/// the space queries may be called concurrently from any number of threads.
/// Construction, [`reset`](Self::reset) and drop take `&mut self`: the
/// borrow checker enforces the exclusivity those operations require.
pub struct Region {
    /// Record-allocations flag in the low bit, lifecycle id above it.
    tag_and_id: u64,
    /// Lock-free stack of shards. Push-only during normal operation.
    shards_head: AtomicPtr<Shard>,
    /// Most recently used shard, a cross-thread hint for the fast path.
    hint: AtomicPtr<Shard>,
    /// User-owned flag in the low bit, address of the arena-hosted policy
    /// record above it (the record is 8-aligned, so the bit is free).
    policy_word: usize,
}

impl Region {
    /// A region with the default policy and no initial block. The first
    /// block is allocated lazily on first use.
    pub fn new() -> Self {
        let mut region = Self::empty();
        region.init(false);
        region
    }

    /// A region that serves its first allocations from caller-supplied
    /// storage. The region uses `mem` but never deallocates it; the caller
    /// must keep it alive for the region's lifetime and release it
    /// afterwards.
    ///
    /// Storage that is null, not 8-byte aligned, or too small to hold the
    /// region's internal structures is silently ignored and the region
    /// behaves as if none had been given.
    ///
    /// **SAFETY**: `mem` must either fail those checks or be valid for
    /// reads and writes of `size` bytes for the life of the region.
    pub unsafe fn with_initial_block(mem: *mut u8, size: usize) -> Self {
        let mut region = Self::empty();
        region.initialize_from(BlockMem { ptr: mem, size });
        region
    }

    /// A region governed by `policy`. The policy is copied by value into the
    /// region's own first block, which is allocated eagerly through the
    /// policy's block allocator.
    pub fn with_policy(policy: AllocationPolicy) -> Self {
        let mut region = Self::empty();
        let record_allocs = policy.record_allocs();
        region.initialize_with_policy(BlockMem::null(), record_allocs, policy);
        region
    }

    /// Combination of [`with_initial_block`](Self::with_initial_block) and
    /// [`with_policy`](Self::with_policy). The supplied storage must also
    /// fit the arena-hosted policy record, otherwise it is ignored and a
    /// block is allocated through the policy instead.
    ///
    /// **SAFETY**: as [`with_initial_block`](Self::with_initial_block).
    pub unsafe fn with_initial_block_and_policy(
        mem: *mut u8,
        size: usize,
        policy: AllocationPolicy,
    ) -> Self {
        let mut region = Self::empty();
        let record_allocs = policy.record_allocs();
        region.initialize_with_policy(BlockMem { ptr: mem, size }, record_allocs, policy);
        region
    }

    fn empty() -> Self {
        Region {
            tag_and_id: 0,
            shards_head: AtomicPtr::new(ptr::null_mut()),
            hint: AtomicPtr::new(ptr::null_mut()),
            policy_word: 0,
        }
    }

    /// Stamps a fresh lifecycle id and clears every shard reference. Any
    /// thread cache entry for the previous incarnation self-invalidates
    /// because its id can never be issued again.
    fn init(&mut self, record_allocs: bool) {
        let id = cache::next_lifecycle_id();
        self.tag_and_id = id | u64::from(record_allocs);
        self.hint.store(ptr::null_mut(), Ordering::Relaxed);
        self.shards_head.store(ptr::null_mut(), Ordering::Relaxed);
        self.policy_word = 0;
    }

    fn initialize_from(&mut self, mem: BlockMem) {
        self.init(false);

        // Ignore an initial block that is unusable; misalignment is treated
        // the same as a block that is too small.
        if !mem.ptr.is_null()
            && mem.ptr as usize & 7 == 0
            && mem.size >= BLOCK_HEADER_SIZE + SHARD_SIZE
        {
            self.policy_word |= USER_OWNED_BIT;
            self.set_initial_block(mem);
        }
    }

    fn initialize_with_policy(
        &mut self,
        mut mem: BlockMem,
        record_allocs: bool,
        policy: AllocationPolicy,
    ) {
        self.init(record_allocs);

        // The first block must additionally fit the policy record, which is
        // about to be self-hosted there.
        let minimum = BLOCK_HEADER_SIZE + SHARD_SIZE + POLICY_SIZE;
        if !mem.ptr.is_null() && mem.ptr as usize & 7 == 0 && mem.size >= minimum {
            self.policy_word = USER_OWNED_BIT;
        } else {
            self.policy_word = 0;
            mem = allocate_block(Some(&policy), 0, minimum);
        }
        self.set_initial_block(mem);

        let shard = unsafe { &*self.shards_head.load(Ordering::Relaxed) };
        let slot = shard
            .maybe_allocate_aligned(POLICY_SIZE)
            .expect("initial block is sized for the policy record");
        unsafe { slot.as_ptr().cast::<AllocationPolicy>().write(policy) };
        self.policy_word |= slot.as_ptr() as usize;
    }

    fn set_initial_block(&mut self, mem: BlockMem) {
        let shard = unsafe { Shard::new_in(mem, cache::thread_token()) };
        self.shards_head.store(shard.as_ptr(), Ordering::Relaxed);
        self.cache_shard(shard);
    }

    #[inline]
    fn lifecycle_id(&self) -> u64 {
        self.tag_and_id & !RECORD_ALLOCS_BIT
    }

    #[inline]
    fn should_record_allocs(&self) -> bool {
        self.tag_and_id & RECORD_ALLOCS_BIT != 0
    }

    #[inline]
    fn user_owned_initial_block(&self) -> bool {
        self.policy_word & USER_OWNED_BIT != 0
    }

    #[inline]
    pub(crate) fn alloc_policy(&self) -> Option<&AllocationPolicy> {
        let addr = self.policy_word & !USER_OWNED_BIT;
        if addr == 0 {
            None
        } else {
            Some(unsafe { &*(addr as *const AllocationPolicy) })
        }
    }

    fn cache_shard(&self, shard: NonNull<Shard>) {
        cache::cache_shard(self.lifecycle_id(), shard);
        // Relaxed is enough: a thread only trusts the hint after matching
        // `owner` against its own token, and its own shard's contents are
        // already visible to it.
        self.hint.store(shard.as_ptr(), Ordering::Relaxed);
    }

    /// The no-atomics fast path. Callers on the plain allocation path pass
    /// the full tag word, so a region that records allocations always falls
    /// through to the recording fallback; the cleanup registration path
    /// passes the bare lifecycle id.
    #[inline]
    fn shard_fast(&self, lifecycle_id: u64) -> Option<NonNull<Shard>> {
        if let Some(shard) = cache::cached_shard(lifecycle_id) {
            return Some(shard);
        }
        if lifecycle_id & RECORD_ALLOCS_BIT != 0 {
            return None;
        }
        // This thread may own the shard another allocation touched last.
        let hinted = NonNull::new(self.hint.load(Ordering::Relaxed))?;
        if unsafe { hinted.as_ref().owner() } == cache::thread_token() {
            return Some(hinted);
        }
        None
    }

    /// Allocates `n` bytes rounded up to 8. The returned pointer is 8-byte
    /// aligned, uninitialized, and valid until the region is reset or
    /// dropped. Never fails: an exhausted backing allocator is fatal.
    #[inline]
    pub fn allocate_aligned(&self, n: usize) -> NonNull<u8> {
        self.allocate_inner(n, None)
    }

    #[inline]
    fn allocate_inner(&self, n: usize, type_name: Option<&'static str>) -> NonNull<u8> {
        if let Some(shard) = self.shard_fast(self.tag_and_id) {
            unsafe { shard.as_ref().allocate_aligned(n, self.alloc_policy()) }
        } else {
            self.allocate_fallback(n, type_name)
        }
    }

    #[cold]
    fn allocate_fallback(&self, n: usize, type_name: Option<&'static str>) -> NonNull<u8> {
        if self.should_record_allocs() {
            self.record_alloc(type_name, n);
            if let Some(shard) = self.shard_fast(self.lifecycle_id()) {
                return unsafe { shard.as_ref().allocate_aligned(n, self.alloc_policy()) };
            }
        }
        let shard = self.get_or_create_shard();
        unsafe { shard.as_ref().allocate_aligned(n, self.alloc_policy()) }
    }

    /// Like [`allocate_aligned`](Self::allocate_aligned), but also reserves
    /// one cleanup slot.
    ///
    /// **SAFETY**: the caller must fully initialize the returned slot's
    /// `elem` and `cleanup` fields before the next reset or drop, and the
    /// written callback must be sound to invoke on the written pointer.
    #[inline]
    pub unsafe fn allocate_aligned_with_cleanup(
        &self,
        n: usize,
    ) -> (NonNull<u8>, NonNull<CleanupRecord>) {
        self.allocate_with_cleanup_inner(n, None)
    }

    #[inline]
    fn allocate_with_cleanup_inner(
        &self,
        n: usize,
        type_name: Option<&'static str>,
    ) -> (NonNull<u8>, NonNull<CleanupRecord>) {
        if let Some(shard) = self.shard_fast(self.tag_and_id) {
            unsafe { shard.as_ref().allocate_aligned_with_cleanup(n, self.alloc_policy()) }
        } else {
            self.allocate_with_cleanup_fallback(n, type_name)
        }
    }

    #[cold]
    fn allocate_with_cleanup_fallback(
        &self,
        n: usize,
        type_name: Option<&'static str>,
    ) -> (NonNull<u8>, NonNull<CleanupRecord>) {
        if self.should_record_allocs() {
            self.record_alloc(type_name, n);
            if let Some(shard) = self.shard_fast(self.lifecycle_id()) {
                return unsafe {
                    shard.as_ref().allocate_aligned_with_cleanup(n, self.alloc_policy())
                };
            }
        }
        let shard = self.get_or_create_shard();
        unsafe { shard.as_ref().allocate_aligned_with_cleanup(n, self.alloc_policy()) }
    }

    /// Registers `cleanup(elem)` to run exactly once at the next reset or
    /// drop, without allocating payload bytes.
    ///
    /// **SAFETY**: `cleanup(elem)` must be sound to invoke at any later
    /// reset/drop point, on whichever thread performs it.
    pub unsafe fn add_cleanup(&self, elem: *mut u8, cleanup: unsafe fn(*mut u8)) {
        if let Some(shard) = self.shard_fast(self.lifecycle_id()) {
            unsafe { shard.as_ref().add_cleanup(elem, cleanup, self.alloc_policy()) }
        } else {
            self.add_cleanup_fallback(elem, cleanup);
        }
    }

    #[cold]
    fn add_cleanup_fallback(&self, elem: *mut u8, cleanup: unsafe fn(*mut u8)) {
        let shard = self.get_or_create_shard();
        unsafe { shard.as_ref().add_cleanup(elem, cleanup, self.alloc_policy()) }
    }

    /// Moves `value` into the region and returns a reference to it. If the
    /// type has drop glue, it is registered as a cleanup record and runs at
    /// the next reset or drop; `Send` is required because that may happen on
    /// another thread.
    pub fn create<T: Send>(&self, value: T) -> &mut T {
        assert!(
            mem::align_of::<T>() <= 8,
            "region allocations are 8-byte aligned"
        );
        let type_name = Some(std::any::type_name::<T>());
        let raw = if mem::needs_drop::<T>() {
            let (ptr, slot) = self.allocate_with_cleanup_inner(mem::size_of::<T>(), type_name);
            unsafe {
                slot.as_ptr().write(CleanupRecord {
                    elem: ptr.as_ptr(),
                    cleanup: drop_value::<T>,
                });
            }
            ptr
        } else {
            self.allocate_inner(mem::size_of::<T>(), type_name)
        };
        unsafe {
            let typed = raw.as_ptr().cast::<T>();
            typed.write(value);
            &mut *typed
        }
    }

    fn record_alloc(&self, type_name: Option<&'static str>, n: usize) {
        if let Some(collector) = self.alloc_policy().and_then(|policy| policy.metrics_collector)
        {
            collector.on_alloc(type_name, n);
        }
    }

    /// The slow path: find this thread's shard on the list, or create and
    /// publish one.
    fn get_or_create_shard(&self) -> NonNull<Shard> {
        let me = cache::thread_token();
        let mut cursor = self.shards_head.load(Ordering::Acquire);
        while let Some(shard) = NonNull::new(cursor) {
            let shard_ref = unsafe { shard.as_ref() };
            if shard_ref.owner() == me {
                self.cache_shard(shard);
                return shard;
            }
            cursor = shard_ref.next_shard();
        }

        // First touch from this thread: it gets a shard of its own, hosted
        // in a fresh block.
        let mem = allocate_block(self.alloc_policy(), 0, SHARD_SIZE);
        let shard = unsafe { Shard::new_in(mem, me) };
        let mut head = self.shards_head.load(Ordering::Relaxed);
        loop {
            unsafe { shard.as_ref().set_next(head) };
            match self.shards_head.compare_exchange_weak(
                head,
                shard.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.cache_shard(shard);
        shard
    }

    /// Runs every registered cleanup. Order between shards is unspecified;
    /// within a shard, newest block first and reverse registration order
    /// within each block.
    fn cleanup_list(&mut self) {
        let mut cursor = self.shards_head.load(Ordering::Acquire);
        while let Some(shard) = NonNull::new(cursor) {
            let shard_ref = unsafe { shard.as_ref() };
            shard_ref.run_cleanup();
            cursor = shard_ref.next_shard();
        }
    }

    /// Frees every block of every shard except the very first shard's oldest
    /// block, which is returned for the caller to free or retain (it may be
    /// user-owned, and the policy record lives in it).
    fn free_blocks(&mut self, freed: &mut u64) -> BlockMem {
        let deallocator = Deallocator::new(self.alloc_policy());
        let mut mem = BlockMem::null();
        let mut cursor = self.shards_head.load(Ordering::Acquire);
        while let Some(shard) = NonNull::new(cursor) {
            let shard_ref = unsafe { shard.as_ref() };
            // Advance first: a shard's structure sits in its own oldest
            // block, which is released one iteration later.
            cursor = shard_ref.next_shard();
            if !mem.ptr.is_null() {
                unsafe { deallocator.deallocate(mem, freed) };
            }
            mem = unsafe { shard_ref.free(&deallocator, freed) };
        }
        mem
    }

    /// Runs every cleanup, releases every block except a user-owned initial
    /// one, and re-initializes the region with its policy preserved by
    /// value. Returns the total bytes that were held.
    pub fn reset(&mut self) -> u64 {
        // Cleanups may reach into memory of other blocks, so all of them run
        // before anything is released.
        self.cleanup_list();

        let mut freed = 0u64;
        let mut mem = self.free_blocks(&mut freed);

        let user_owned = self.user_owned_initial_block();
        // The policy record lives in the block still held in `mem`; copy it
        // out before that block can go away.
        let saved = self.alloc_policy().copied();
        match saved {
            Some(policy) => {
                if user_owned {
                    freed += mem.size as u64;
                } else {
                    unsafe { Deallocator::new(Some(&policy)).deallocate(mem, &mut freed) };
                    mem = BlockMem::null();
                }
                if let Some(collector) = policy.metrics_collector {
                    collector.on_reset(freed);
                }
                let record_allocs = self.should_record_allocs();
                self.initialize_with_policy(mem, record_allocs, policy);
            }
            None if user_owned => {
                freed += mem.size as u64;
                self.initialize_from(mem);
            }
            None => {
                if !mem.ptr.is_null() {
                    unsafe { Deallocator::new(None).deallocate(mem, &mut freed) };
                }
                self.init(false);
            }
        }
        freed
    }

    /// Total bytes obtained from the block allocator, plus the user-owned
    /// initial block's size if one was supplied. Concurrent readers may see
    /// a value that lags in-flight growth.
    pub fn space_allocated(&self) -> u64 {
        let mut total = 0;
        let mut cursor = self.shards_head.load(Ordering::Acquire);
        while let Some(shard) = NonNull::new(cursor) {
            let shard_ref = unsafe { shard.as_ref() };
            total += shard_ref.space_allocated();
            cursor = shard_ref.next_shard();
        }
        total
    }

    /// Bytes handed out to callers since construction or the last reset,
    /// excluding the region's own bookkeeping structures.
    pub fn space_used(&self) -> u64 {
        let mut total = 0;
        let mut cursor = self.shards_head.load(Ordering::Acquire);
        while let Some(shard) = NonNull::new(cursor) {
            let shard_ref = unsafe { shard.as_ref() };
            total += shard_ref.space_used();
            cursor = shard_ref.next_shard();
        }
        // The self-hosted policy record is bookkeeping, not user data.
        if self.alloc_policy().is_some() {
            total -= POLICY_SIZE as u64;
        }
        total
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.cleanup_list();

        let mut freed = 0u64;
        let mem = self.free_blocks(&mut freed);

        // Read the collector out before the block hosting the policy record
        // is released.
        let saved = self.alloc_policy().copied();
        if self.user_owned_initial_block() {
            freed += mem.size as u64;
        } else if !mem.ptr.is_null() {
            unsafe { Deallocator::new(saved.as_ref()).deallocate(mem, &mut freed) };
        }
        if let Some(collector) = saved.and_then(|policy| policy.metrics_collector) {
            collector.on_destroy(freed);
        }
    }
}
