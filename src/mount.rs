//! Mount/unmount orchestration (spec.md §6): attach to an existing BPRAM region or format a
//! fresh one, verify the superblock, and rebuild the in-memory bitmaps (and, when the medium
//! was not cleanly unmounted, the link-count graph) from the live tree.

use std::collections::{HashMap, HashSet};

use crate::alloc::{BlockAllocator, InodeAllocator};
use crate::bpram::{BlockNo, Bpram};
use crate::commit::sp;
use crate::commit_policy::CommitMode;
use crate::crawler;
use crate::dirent;
use crate::error::{Error, Result};
use crate::inode::{self, InodeNo, INODES_PER_BLOCK, INODE_SIZE};
use crate::stat::FileType;
use crate::superblock::Superblock;
use crate::txn::Txn;

/// Verifies magic/version and region size, recovers the authoritative superblock (resolving
/// SP's double-super scheme if applicable), and rebuilds both bitmap allocators from a live
/// scan of the inode tree. Returns the ready-to-use triple a [`crate::fs::Filesystem`] wraps.
pub fn mount(bpram: &mut Bpram) -> Result<(Superblock, BlockAllocator, InodeAllocator)> {
    let mut sb = match Superblock::read_primary(bpram) {
        Some(sb) if sb.is_valid_magic() => sb,
        _ => return Err(Error::InvalidArgument),
    };
    if sb.version != crate::superblock::FORMAT_VERSION {
        return Err(Error::InvalidArgument);
    }
    if sb.nblocks > bpram.capacity_blocks() {
        return Err(Error::InvalidArgument);
    }

    if sb.commit_mode == CommitMode::Sp {
        sb = sp::recover(bpram).ok_or(Error::InvalidArgument)?;
    }

    let ninodes = (sb.inode_root.nbytes / INODE_SIZE as u64).max(INODES_PER_BLOCK);

    // A scratch transaction for the read-only scan below: it never stages a write, so its
    // allocators are never consulted, but `crawl_tree_ro` still wants a `Txn` to borrow.
    let mut scratch_blocks = BlockAllocator::new(1);
    let mut scratch_inodes = InodeAllocator::new(1);
    let (used_blocks, used_inodes) = {
        let mut txn = Txn::new(bpram, &mut scratch_blocks, &mut scratch_inodes, sb.commit_mode);
        scan_live(&mut txn, &sb, ninodes)?
    };

    let blocks = BlockAllocator::from_bits(
        bits_from_set(sb.nblocks, &used_blocks, BlockNo::FIRST_ALLOC.get()),
        sb.nblocks,
    );
    let inodes = InodeAllocator::from_bits(bits_from_set(ninodes, &used_inodes, 1), ninodes);

    let was_ephemeral_valid = sb.ephemeral_valid;
    sb.ephemeral_valid = true;

    let mut blocks = blocks;
    let mut inodes = inodes;
    if !was_ephemeral_valid {
        recompute_nlinks(bpram, &mut blocks, &mut inodes, &mut sb)?;
    }

    Ok((sb, blocks, inodes))
}

/// Allocates an anonymous region and formats it, for tests and ephemeral mounts that don't
/// need an on-disk file.
pub fn mount_anon(
    nblocks: u64,
    commit_mode: CommitMode,
    now: u64,
) -> Result<(Bpram, Superblock, BlockAllocator, InodeAllocator)> {
    let mut bpram = Bpram::anon(nblocks);
    let (sb, blocks, inodes) = crate::format::mkbpfs(&mut bpram, nblocks, commit_mode, now)?;
    Ok((bpram, sb, blocks, inodes))
}

/// Marks the superblock cleanly unmounted: on next mount, `ephemeral_valid` tells the loader
/// the on-medium `nlinks` values can be trusted as-is, skipping the tree walk.
pub fn unmount(bpram: &mut Bpram, sb: &mut Superblock) {
    sb.ephemeral_valid = true;
    sb.write_both(bpram);
    bpram.epoch_barrier();
}

fn bits_from_set(total: u64, used: &HashSet<u64>, reserved_low: u64) -> Vec<u8> {
    let mut bits = vec![0u8; (total as usize).div_ceil(8)];
    for &idx in used {
        if idx < total {
            bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }
    for reserved in 0..reserved_low.min(total) {
        bits[(reserved / 8) as usize] |= 1 << (reserved % 8);
    }
    bits
}

/// Rebuilds both bitmaps from a fresh live-tree scan and asserts they match the allocators'
/// current staged bits bit-for-bit (spec.md §6 "Environment knobs" — the random-interval
/// consistency check `crate::config::Config::consistency_check_interval` drives). A mismatch
/// is a structural invariant violation, not a recoverable error.
pub fn check_consistency(
    bpram: &mut Bpram,
    blocks: &BlockAllocator,
    inodes: &InodeAllocator,
    sb: &Superblock,
) -> Result<()> {
    let ninodes = (sb.inode_root.nbytes / INODE_SIZE as u64).max(INODES_PER_BLOCK);
    let mut scratch_blocks = BlockAllocator::new(1);
    let mut scratch_inodes = InodeAllocator::new(1);
    let (used_blocks, used_inodes) = {
        let mut txn = Txn::new(bpram, &mut scratch_blocks, &mut scratch_inodes, sb.commit_mode);
        scan_live(&mut txn, sb, ninodes)?
    };
    let expect_blocks = bits_from_set(sb.nblocks, &used_blocks, BlockNo::FIRST_ALLOC.get());
    let expect_inodes = bits_from_set(ninodes, &used_inodes, 1);
    crate::error::invariant(
        blocks.raw_bits() == expect_blocks.as_slice(),
        "block bitmap diverged from live tree scan",
    );
    crate::error::invariant(
        inodes.raw_bits() == expect_inodes.as_slice(),
        "inode bitmap diverged from live tree scan",
    );
    Ok(())
}

/// Walks the inode table tree and every live inode's data tree, collecting every block number
/// and inode slot in use (spec.md §6, and property 4 of §8).
fn scan_live(txn: &mut Txn, sb: &Superblock, ninodes: u64) -> Result<(HashSet<u64>, HashSet<u64>)> {
    let mut used_blocks = HashSet::new();
    let mut used_inodes = HashSet::new();
    crawler::crawl_blocknos(txn.bpram, &sb.inode_root, 0, sb.inode_root.nbytes, &mut |no| {
        used_blocks.insert(no.get());
        Ok(())
    })?;
    for slot in 1..ninodes {
        let ino = InodeNo(slot);
        let record = inode::read_inode(txn, sb, ino)?;
        if record.nlinks == 0 {
            continue;
        }
        used_inodes.insert(slot);
        crawler::crawl_blocknos(txn.bpram, &record.root, 0, record.root.nbytes, &mut |no| {
            used_blocks.insert(no.get());
            Ok(())
        })?;
    }
    Ok((used_blocks, used_inodes))
}

/// Recomputes every reachable inode's `nlinks` from the live dirent graph (spec.md §6, §8
/// property 5), used on first mount after an unclean shutdown (`!ephemeral_valid`).
/// Directories get `2 + (number of child subdirectories)`; other inode types get the number
/// of dirents across the whole tree that name them (hard links).
fn recompute_nlinks(
    bpram: &mut Bpram,
    blocks: &mut BlockAllocator,
    inodes: &mut InodeAllocator,
    sb: &mut Superblock,
) -> Result<()> {
    let mut counts: HashMap<u64, u32> = HashMap::new();
    {
        let mut txn = Txn::new(bpram, blocks, inodes, sb.commit_mode);
        visit_dir(&mut txn, sb, InodeNo::ROOT, &mut counts)?;
        for (&ino, &count) in counts.iter() {
            let ino = InodeNo(ino);
            let mut rec = inode::read_inode(&mut txn, sb, ino)?;
            if rec.nlinks != count {
                rec.nlinks = count;
                inode::write_inode(&mut txn, sb, ino, &rec)?;
            }
        }
        txn.commit(sb);
    }
    sb.ephemeral_valid = true;
    Ok(())
}

fn visit_dir(
    txn: &mut Txn,
    sb: &Superblock,
    dir_ino: InodeNo,
    counts: &mut HashMap<u64, u32>,
) -> Result<()> {
    let dir = inode::read_inode(txn, sb, dir_ino)?;
    let entries = dirent::read_all(txn, &dir.root)?;
    let mut subdirs = 0u32;
    for e in entries {
        if e.is_free() || e.name == b"." || e.name == b".." {
            continue;
        }
        *counts.entry(e.ino.get()).or_insert(0) += 1;
        if e.file_type == Some(FileType::Directory) {
            subdirs += 1;
            visit_dir(txn, sb, e.ino, counts)?;
        }
    }
    counts.insert(dir_ino.get(), 2 + subdirs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_after_format_round_trips() {
        let (mut bpram, sb, _blocks, _inodes) = mount_anon(64, CommitMode::Scsp, 0).unwrap();
        let (remounted, _b2, _i2) = mount(&mut bpram).unwrap();
        assert_eq!(remounted.nblocks, sb.nblocks);
        assert_eq!(remounted.inode_root, sb.inode_root);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bpram = Bpram::anon(16);
        assert!(mount(&mut bpram).is_err());
    }
}
