//! The BPRAM region: a contiguous, block-aligned, process-private mutable byte buffer.
//!
//! Mirrors `spec.md` §6's "pointer + length, block-aligned" contract. Two backing forms are
//! supported, matching the two mount startup forms of §6: an anonymous in-memory region
//! (`Bpram::anon`) and a memory-mapped file (`Bpram::map_file`), the latter grounded the same
//! way the teacher's own integration-test harness maps its disk image
//! (`examples/maestro-os-maestro/inttest` uses `memmap2`).

use memmap2::MmapMut;
use std::fs::File;
use std::io;
use std::ops::{Deref, DerefMut};

/// Size in bytes of one block. Fixed per spec.md §2.
pub const BLOCK_SIZE: usize = 4096;

enum Backing {
    Anon(Box<[u8]>),
    Mapped(MmapMut),
}

impl Deref for Backing {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Backing::Anon(b) => b,
            Backing::Mapped(m) => m,
        }
    }
}

impl DerefMut for Backing {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            Backing::Anon(b) => b,
            Backing::Mapped(m) => m,
        }
    }
}

/// A block number. `0` is reserved invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockNo(pub u64);

impl BlockNo {
    pub const INVALID: BlockNo = BlockNo(0);
    pub const SUPER: BlockNo = BlockNo(1);
    pub const SUPER_2: BlockNo = BlockNo(2);
    pub const FIRST_ALLOC: BlockNo = BlockNo(3);

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for BlockNo {
    fn from(v: u64) -> Self {
        BlockNo(v)
    }
}

/// The mapped BPRAM region, treated as an array of fixed-size blocks.
pub struct Bpram {
    backing: Backing,
    /// Total number of blocks the region can hold (`len / BLOCK_SIZE`), independent of how
    /// many blocks the mounted filesystem actually uses (`Superblock::nblocks`).
    capacity_blocks: u64,
}

impl Bpram {
    /// Allocates an anonymous, zeroed, block-aligned region of `nblocks` blocks.
    pub fn anon(nblocks: u64) -> Self {
        let len = nblocks as usize * BLOCK_SIZE;
        Self {
            backing: Backing::Anon(vec![0u8; len].into_boxed_slice()),
            capacity_blocks: nblocks,
        }
    }

    /// Memory-maps an existing file read-write. The file's length must already be a multiple
    /// of [`BLOCK_SIZE`].
    pub fn map_file(file: &File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        assert!(
            len as usize % BLOCK_SIZE == 0,
            "bpram file length must be block-aligned"
        );
        let mmap = unsafe { MmapMut::map_mut(file)? };
        Ok(Self {
            capacity_blocks: len / BLOCK_SIZE as u64,
            backing: Backing::Mapped(mmap),
        })
    }

    /// Total number of blocks physically backing this region.
    #[inline]
    pub fn capacity_blocks(&self) -> u64 {
        self.capacity_blocks
    }

    /// Returns an immutable view of block `no`.
    #[inline]
    pub fn block(&self, no: BlockNo) -> &[u8] {
        let off = no.0 as usize * BLOCK_SIZE;
        &self.backing[off..off + BLOCK_SIZE]
    }

    /// Returns a mutable view of block `no`.
    #[inline]
    pub fn block_mut(&mut self, no: BlockNo) -> &mut [u8] {
        let off = no.0 as usize * BLOCK_SIZE;
        &mut self.backing[off..off + BLOCK_SIZE]
    }

    /// Copies the contents of `src` into `dst`. Used by whole-block CoW.
    pub fn copy_block(&mut self, src: BlockNo, dst: BlockNo) {
        debug_assert_ne!(src.0, dst.0);
        let split_at = src.0.max(dst.0) as usize * BLOCK_SIZE;
        let (low, high) = self.backing.split_at_mut(split_at);
        let (src_buf, dst_buf): (&[u8], &mut [u8]) = if src.0 < dst.0 {
            let off = src.0 as usize * BLOCK_SIZE;
            (&low[off..off + BLOCK_SIZE], &mut high[..BLOCK_SIZE])
        } else {
            let off = dst.0 as usize * BLOCK_SIZE;
            (&high[..BLOCK_SIZE], &mut low[off..off + BLOCK_SIZE])
        };
        dst_buf.copy_from_slice(src_buf);
    }

    /// Zeroes block `no` in place.
    pub fn zero_block(&mut self, no: BlockNo) {
        self.block_mut(no).fill(0);
    }

    /// Issues a compiler/hardware fence preventing reordering of writes across this point.
    /// Separates commit substeps that must not be interchanged (spec.md §5), notably between
    /// updating super copy 1 and super copy 2 in SP mode.
    #[inline]
    pub fn epoch_barrier(&self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_block_forward_and_backward() {
        let mut b = Bpram::anon(8);
        b.block_mut(BlockNo(3)).fill(0xAB);
        b.copy_block(BlockNo(3), BlockNo(5));
        assert!(b.block(BlockNo(5)).iter().all(|&x| x == 0xAB));
        b.block_mut(BlockNo(6)).fill(0xCD);
        b.copy_block(BlockNo(6), BlockNo(4));
        assert!(b.block(BlockNo(4)).iter().all(|&x| x == 0xCD));
    }
}
