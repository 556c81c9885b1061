//! The formatter that lays down an initial superblock (spec.md §6), grounded on
//! `examples/original_source/mkbpfs.c`: allocate the inode-table root, carve out the root
//! directory's inode, and write the magic number last.
//!
//! Unlike the original, an empty directory's data tree stays `TreeRoot::EMPTY` (`nbytes ==
//! 0`) rather than pre-allocating a block holding a single `rec_len == 0` sentinel — reading
//! zero bytes from an empty tree already yields "no entries" (`crate::dirent::read_all`), so
//! the sentinel block the C implementation needs has no counterpart here.

use crate::alloc::{BlockAllocator, InodeAllocator};
use crate::bpram::Bpram;
use crate::commit_policy::CommitMode;
use crate::error::{Error, Result};
use crate::inode::{self, Inode, InodeNo};
use crate::stat::FileType;
use crate::superblock::Superblock;
use crate::txn::Txn;

/// Smallest block count this formatter accepts: reserved blocks plus enough allocatable room
/// for an inode-table root, its first indirect/data block, and the root directory's own
/// (initially-empty) data tree to have somewhere to grow.
pub const MIN_NBLOCKS: u64 = 8;

/// Lays down a brand-new filesystem over `bpram`, using exactly `nblocks` of its capacity
/// (`bpram.capacity_blocks()` may exceed this; spec.md §6 only requires `nblocks * B <=
/// region_size`). Returns the in-memory superblock and freshly-initialized allocators ready
/// to be handed to `crate::fs::Filesystem`.
pub fn mkbpfs(
    bpram: &mut Bpram,
    nblocks: u64,
    commit_mode: CommitMode,
    now: u64,
) -> Result<(Superblock, BlockAllocator, InodeAllocator)> {
    if nblocks < MIN_NBLOCKS {
        return Err(Error::OutOfSpace);
    }
    if nblocks > bpram.capacity_blocks() {
        return Err(Error::InvalidArgument);
    }

    let uuid = uuid::Uuid::new_v4().into_bytes();
    let mut blocks = BlockAllocator::new(nblocks);
    let mut inodes = InodeAllocator::new(inode::INODES_PER_BLOCK);
    // The root directory occupies InodeNo::ROOT (1) from the very first mount onward, so its
    // slot must be reserved the same way BlockAllocator::new reserves its low block numbers —
    // outside any transaction, before the allocator is ever handed to a caller.
    let root_slot = inodes.try_alloc().expect("freshly-sized inode allocator cannot be exhausted");
    debug_assert_eq!(root_slot, InodeNo::ROOT.get());
    inodes.commit();

    let mut sb = Superblock::new(nblocks, commit_mode, uuid);
    // Writing magic is the last step of formatting (spec.md §6): zero it out while the inode
    // tree is constructed so a crash mid-format never presents a filesystem that looks valid.
    sb.magic = 0;

    let root_mode = FileType::Directory.type_bits() | 0o755;
    let mut root_inode = Inode::new(root_mode, 0, 0, now, 1);
    root_inode.nlinks = 2; // "." and the (unmaterialized) ".." back-edge.

    {
        let mut txn = Txn::new(bpram, &mut blocks, &mut inodes, commit_mode);
        inode::write_inode(&mut txn, &mut sb, InodeNo::ROOT, &root_inode)?;
        txn.commit(&mut sb);
    }

    sb.magic = crate::superblock::MAGIC;
    sb.write_both(bpram);
    bpram.epoch_barrier();

    Ok((sb, blocks, inodes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_produces_valid_root_dir() {
        let mut bpram = Bpram::anon(64);
        let (sb, mut blocks, mut inodes) = mkbpfs(&mut bpram, 64, CommitMode::Scsp, 1000).unwrap();
        assert!(sb.is_valid_magic());
        assert_eq!(sb.nblocks, 64);

        let mut txn = Txn::new(&mut bpram, &mut blocks, &mut inodes, CommitMode::Scsp);
        let root = inode::read_inode(&mut txn, &sb, InodeNo::ROOT).unwrap();
        assert_eq!(root.nlinks, 2);
        assert_eq!(root.file_type(), Some(FileType::Directory));
        assert_eq!(root.root.nbytes, 0);
    }

    #[test]
    fn rejects_too_small_region() {
        let mut bpram = Bpram::anon(4);
        let err = mkbpfs(&mut bpram, 4, CommitMode::Scsp, 0).unwrap_err();
        assert!(matches!(err, Error::OutOfSpace));
    }
}
