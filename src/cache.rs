//! The per-thread fast-path cache and the lifecycle id generator.
//!
//! A thread that repeatedly allocates from the same region should not pay
//! for an atomic walk of the shard list every time. Instead each thread
//! remembers the shard it used last, keyed by the owning region's lifecycle
//! id. Ids are process-unique per region construction, so a cache entry for
//! a destroyed region can never be mistaken for the region that reuses its
//! address.

use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::shard::Shard;

/// How many lifecycle ids a thread takes from the global generator at once.
/// Ids advance by two because the low bit of a region's tag word carries the
/// record-allocations flag.
const PER_THREAD_IDS: u64 = 32;
const ID_DELTA: u64 = 2;
const ID_BATCH: u64 = PER_THREAD_IDS * ID_DELTA;

static LIFECYCLE_ID_GENERATOR: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy)]
struct ThreadCache {
    /// The id the next region constructed on this thread will receive.
    next_lifecycle_id: u64,
    /// Lifecycle id of the region this thread most recently allocated from.
    last_lifecycle_id: u64,
    /// The shard matching `last_lifecycle_id`.
    last_shard: *mut Shard,
}

thread_local! {
    static THREAD_CACHE: Cell<ThreadCache> = const {
        Cell::new(ThreadCache {
            next_lifecycle_id: 0,
            last_lifecycle_id: u64::MAX,
            last_shard: ptr::null_mut(),
        })
    };
}

/// Opaque identity token for the calling thread. Shards remember the token
/// of the thread that created them; the token is the address of the
/// thread-local cache cell, stable for the life of the thread.
#[inline]
pub(crate) fn thread_token() -> usize {
    THREAD_CACHE.with(|cell| cell as *const Cell<ThreadCache> as usize)
}

/// Issues the lifecycle id for a region constructed (or reset) on this
/// thread. Ids are even and unique across the process up to `u64`
/// wraparound, which is not expected; threads consume them in batches so the
/// global counter is touched once per [`PER_THREAD_IDS`] constructions.
pub(crate) fn next_lifecycle_id() -> u64 {
    THREAD_CACHE.with(|cell| {
        let mut cache = cell.get();
        let mut id = cache.next_lifecycle_id;
        if id & (ID_BATCH - 1) == 0 {
            id = LIFECYCLE_ID_GENERATOR
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_mul(ID_BATCH);
        }
        cache.next_lifecycle_id = id + ID_DELTA;
        cell.set(cache);
        id
    })
}

/// The cached shard for `lifecycle_id`, if this thread used it last.
#[inline]
pub(crate) fn cached_shard(lifecycle_id: u64) -> Option<NonNull<Shard>> {
    THREAD_CACHE.with(|cell| {
        let cache = cell.get();
        if cache.last_lifecycle_id == lifecycle_id {
            NonNull::new(cache.last_shard)
        } else {
            None
        }
    })
}

/// Remember `shard` as this thread's entry into the region identified by
/// `lifecycle_id`.
#[inline]
pub(crate) fn cache_shard(lifecycle_id: u64, shard: NonNull<Shard>) {
    THREAD_CACHE.with(|cell| {
        let mut cache = cell.get();
        cache.last_lifecycle_id = lifecycle_id;
        cache.last_shard = shard.as_ptr();
        cell.set(cache);
    });
}
