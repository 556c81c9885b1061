//! The block and inode allocators: [`BitmapAllocator`] wrapped with the reserved-range and
//! grow-on-demand policy of spec.md §4.2.

use crate::bitmap::BitmapAllocator;
use crate::bpram::BlockNo;
use crate::error::{Error, Result};

/// Wraps the block bitmap. Reserved block numbers `1..FIRST_ALLOC` are never staged.
#[derive(Debug, Clone)]
pub struct BlockAllocator {
    bitmap: BitmapAllocator,
}

impl BlockAllocator {
    /// Creates an allocator over `nblocks` total blocks, with blocks `0..FIRST_ALLOC` marked
    /// permanently used (invalid sentinel + the two superblock copies).
    pub fn new(nblocks: u64) -> Self {
        let mut bitmap = BitmapAllocator::new(nblocks);
        for reserved in 0..BlockNo::FIRST_ALLOC.get() {
            // Mark reserved blocks used outside of any transaction so they are never handed
            // out and never appear on an allocs/frees list.
            let idx = bitmap.alloc();
            debug_assert_eq!(idx, reserved);
        }
        bitmap.commit();
        Self { bitmap }
    }

    /// Rebuilds from a live-tree scan at mount (spec.md §6).
    pub fn from_bits(bits: Vec<u8>, nblocks: u64) -> Self {
        Self {
            bitmap: BitmapAllocator::from_bits(bits, nblocks),
        }
    }

    /// Allocates a block, returning [`Error::OutOfSpace`] on exhaustion. Memory-protection
    /// poisoning of freshly-obtained pages (spec.md §4.2) is a debug-build concern of the
    /// host kernel this crate does not emulate in a hosted environment; the block is zeroed
    /// by the caller via the crawler's CoW primitives instead.
    pub fn alloc_block(&mut self) -> Result<BlockNo> {
        let idx = self.bitmap.alloc();
        if idx >= self.bitmap.total() {
            return Err(Error::OutOfSpace);
        }
        Ok(BlockNo(idx))
    }

    /// Frees a block. Asserts `no >= FIRST_ALLOC` (programming error otherwise).
    pub fn free_block(&mut self, no: BlockNo) {
        assert!(
            no.get() >= BlockNo::FIRST_ALLOC.get(),
            "attempted to free a reserved block"
        );
        self.bitmap.free(no.get());
    }

    pub fn unalloc_block(&mut self, no: BlockNo) {
        self.bitmap.unalloc(no.get());
    }

    pub fn unfree_block(&mut self, no: BlockNo) {
        self.bitmap.unfree(no.get());
    }

    pub fn freshly_alloced(&self, no: BlockNo) -> bool {
        self.bitmap.freshly_alloced(no.get())
    }

    pub fn commit(&mut self) {
        self.bitmap.commit();
    }

    pub fn abort(&mut self) {
        self.bitmap.abort();
    }

    pub fn resize(&mut self, new_total: u64) {
        self.bitmap.resize(new_total);
    }

    pub fn total(&self) -> u64 {
        self.bitmap.total()
    }

    pub fn free_count(&self) -> u64 {
        self.bitmap.count_free()
    }

    pub fn raw_bits(&self) -> &[u8] {
        self.bitmap.raw_bits()
    }
}

/// Wraps the inode bitmap. Identical to [`BlockAllocator`] except it can grow: when
/// exhausted, the core extends the inode tree by one block through the crawler, resizes the
/// bitmap, and retries (spec.md §4.2). The grow-and-retry step itself is orchestrated by
/// `crate::fs`, since it requires a transaction and the crawler; this allocator only tracks
/// the staged bits.
#[derive(Debug, Clone)]
pub struct InodeAllocator {
    bitmap: BitmapAllocator,
}

impl InodeAllocator {
    /// Creates an allocator over `ninodes` slots, with inode `0` (invalid) marked used.
    pub fn new(ninodes: u64) -> Self {
        let mut bitmap = BitmapAllocator::new(ninodes);
        let idx = bitmap.alloc();
        debug_assert_eq!(idx, 0);
        bitmap.commit();
        Self { bitmap }
    }

    pub fn from_bits(bits: Vec<u8>, ninodes: u64) -> Self {
        Self {
            bitmap: BitmapAllocator::from_bits(bits, ninodes),
        }
    }

    /// Attempts an allocation without growing. Returns `None` on exhaustion so the caller can
    /// decide to grow the inode table and retry.
    pub fn try_alloc(&mut self) -> Option<u64> {
        let idx = self.bitmap.alloc();
        if idx >= self.bitmap.total() {
            None
        } else {
            Some(idx)
        }
    }

    pub fn free(&mut self, ino: u64) {
        self.bitmap.free(ino);
    }

    pub fn unalloc(&mut self, ino: u64) {
        self.bitmap.unalloc(ino);
    }

    pub fn unfree(&mut self, ino: u64) {
        self.bitmap.unfree(ino);
    }

    pub fn freshly_alloced(&self, ino: u64) -> bool {
        self.bitmap.freshly_alloced(ino)
    }

    pub fn commit(&mut self) {
        self.bitmap.commit();
    }

    pub fn abort(&mut self) {
        self.bitmap.abort();
    }

    pub fn resize(&mut self, new_total: u64) {
        self.bitmap.resize(new_total);
    }

    pub fn total(&self) -> u64 {
        self.bitmap.total()
    }

    pub fn free_count(&self) -> u64 {
        self.bitmap.count_free()
    }

    pub fn raw_bits(&self) -> &[u8] {
        self.bitmap.raw_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_allocator_reserves_low_numbers() {
        let mut ba = BlockAllocator::new(16);
        let first = ba.alloc_block().unwrap();
        assert_eq!(first, BlockNo::FIRST_ALLOC);
    }

    #[test]
    fn inode_allocator_reserves_zero() {
        let mut ia = InodeAllocator::new(8);
        let first = ia.try_alloc().unwrap();
        assert_eq!(first, 1);
    }

    #[test]
    fn block_allocator_grow_then_abort_resize() {
        let mut ba = BlockAllocator::new(8);
        ba.resize(16);
        assert_eq!(ba.total(), 16);
        ba.abort();
        assert_eq!(ba.total(), 8);
    }
}
