use std::cell::Cell;
use std::mem;
use std::ptr::NonNull;

use crate::cleanup::CleanupRecord;
use crate::utils::align8;

/// Header size of a block, rounded so the allocation frontier that starts
/// right behind it is 8-byte aligned.
pub(crate) const BLOCK_HEADER_SIZE: usize = align8(mem::size_of::<Block>());

/// One contiguous chunk of backing memory managed by a
/// [`Shard`](crate::shard::Shard). The fields of this struct are the block's
/// metadata, written in place at the base of the storage; everything behind
/// the header belongs to the arena's users.
///
/// ```text
/// +------------------+        +
/// |       prev       |        |
/// +------------------+        | -> Header
/// |       size       |        |
/// +------------------+        |
/// |   cleanup_tail   |        |
/// +------------------+        +
/// |   allocations    |  | grows down
/// |                  |  v
/// +------------------+ <- cleanup_tail (frozen boundary)
/// | cleanup records  |  ^ grows up
/// +------------------+ <- base + (size & !7)
/// ```
pub(crate) struct Block {
    /// The older block in this shard's chain, or `None` for the first one.
    pub prev: Option<NonNull<Block>>,
    /// Total byte length of the block, header included.
    pub size: usize,
    /// Boundary between used allocation space (below) and the cleanup-record
    /// region (at and above). Stamped from the shard's live `limit` when the
    /// block is retired and again right before the records run.
    pub cleanup_tail: Cell<*mut CleanupRecord>,
}

impl Block {
    /// Writes a block header at the base of `storage`. The payload is left
    /// untouched.
    ///
    /// **SAFETY**: `storage` must be 8-byte aligned, valid for writes of
    /// `size` bytes, and `size` must be at least [`BLOCK_HEADER_SIZE`].
    pub unsafe fn init(
        storage: *mut u8,
        size: usize,
        prev: Option<NonNull<Block>>,
    ) -> NonNull<Block> {
        unsafe {
            let block = storage.cast::<Block>();
            block.write(Block {
                prev,
                size,
                cleanup_tail: Cell::new(storage.add(size & !7).cast()),
            });
            NonNull::new_unchecked(block)
        }
    }

    /// Address `offset` bytes into the block, counted from the header base.
    #[inline]
    pub fn at(&self, offset: usize) -> *mut u8 {
        unsafe { (self as *const Block as *mut u8).add(offset) }
    }

    /// First payload byte, right behind the header.
    #[inline]
    pub fn payload(&self) -> *mut u8 {
        self.at(BLOCK_HEADER_SIZE)
    }

    /// Aligned high boundary `base + (size & !7)`. The cleanup region ends
    /// here; nothing of the block past this address is ever used.
    #[inline]
    pub fn aligned_limit(&self) -> *mut u8 {
        self.at(self.size & !7)
    }
}
