//! The generic tree traversal that backs every read, write and truncate (spec.md §4.4).
//!
//! One recursive descent handles file-data trees and the inode table alike: both are height
//! indexed block trees rooted in a [`TreeRoot`], so `crawl_tree` is parameterized only by the
//! root value, a byte range, and a leaf callback — never by what the bytes mean. Callers
//! (`crate::inode`, `crate::fs`) interpret the leaf bytes as file content or as packed inode
//! records; the crawler only moves bytes and decides which blocks need copying.

use crate::alloc::BlockAllocator;
use crate::bpram::{BlockNo, Bpram, BLOCK_SIZE};
use crate::commit_policy::CommitPolicy;
use crate::cow::{cow_block, cow_block_entire, cow_block_hole};
use crate::error::Result;
use crate::ha::{Ha, TreeRoot};
use crate::tree::{self, ENTRIES_PER_IBLOCK};
use crate::txn::Txn;

/// What a leaf callback asks the crawler to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlOutcome {
    Continue,
    Stop,
}

/// Leaf-visiting closure: given the absolute byte offset of `block` from the start of the
/// tree, the block's bytes, the `[off, off+size)` sub-range within it that is in scope for
/// this call, and whether that sub-range lies within `valid` (previously written) bytes,
/// either reads from or writes into `block[off..off+size]` and returns whether to keep going.
pub type LeafFn<'a> =
    dyn FnMut(u64, &mut [u8], usize, usize, bool, CommitPolicy) -> Result<CrawlOutcome> + 'a;

/// Walks `root` over the half-open byte range `[off, off + size)`, growing the tree first if
/// the range extends past its current capacity and `policy` permits writing. Returns the
/// tree's root value after the walk, which the caller must compare against the original and
/// publish (`crate::commit::publish_super_root`, or the equivalent inode-table patch in
/// `crate::inode`) if it changed.
pub fn crawl_tree(
    txn: &mut Txn,
    root: &mut TreeRoot,
    off: u64,
    size: u64,
    policy: CommitPolicy,
    cb: &mut LeafFn,
) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let policy = policy.for_mode(txn.mode);
    let end = off + size;
    if policy != CommitPolicy::None {
        let needed_height = tree::height_for(end.div_ceil(BLOCK_SIZE as u64).max(1));
        if needed_height > root.height() {
            *root = tree::change_height(txn, *root, needed_height)?;
        }
    }
    let valid = root.nbytes;
    let span = tree::max_nblocks(root.height()) * BLOCK_SIZE as u64;
    let new_ha = crawl_level(
        txn,
        root.ha,
        span,
        off.min(span),
        (size).min(span.saturating_sub(off)),
        valid,
        policy,
        cb,
    )?;
    root.ha = new_ha;
    if policy != CommitPolicy::None && end > root.nbytes {
        root.nbytes = end;
    }
    Ok(())
}

/// Read-only convenience wrapper used for pure reads (`getattr`/`read`), so call sites don't
/// need to construct a throwaway mutable `TreeRoot`.
pub fn crawl_tree_ro(
    txn: &mut Txn,
    root: &TreeRoot,
    off: u64,
    size: u64,
    cb: &mut LeafFn,
) -> Result<()> {
    let mut root_copy = *root;
    crawl_tree(txn, &mut root_copy, off, size, CommitPolicy::None, cb)
}

fn crawl_level(
    txn: &mut Txn,
    ha: Ha,
    span: u64,
    off: u64,
    size: u64,
    valid: u64,
    policy: CommitPolicy,
    cb: &mut LeafFn,
) -> Result<Ha> {
    if size == 0 {
        return Ok(ha);
    }
    if ha.height() == 0 {
        return crawl_leaf(txn, ha, off, size, valid, policy, cb);
    }
    let child_span = span / ENTRIES_PER_IBLOCK;
    let first_child = off / child_span;
    let last_child = (off + size - 1) / child_span;
    let beyond_valid_whole = off >= valid;
    let resolved = policy.descend(first_child, last_child, beyond_valid_whole);

    if ha.is_hole() {
        if resolved == CommitPolicy::None {
            return read_zero_range(span, off, size, valid, cb).map(|()| ha);
        }
        let new_block = cow_block_hole(txn.bpram, txn.blocks, &mut txn.shadow, txn.mode)?;
        return write_children(
            txn,
            Ha::new(ha.height(), new_block),
            true,
            child_span,
            first_child,
            last_child,
            off,
            size,
            valid,
            resolved,
            cb,
        );
    }

    let must_copy_block = matches!(resolved, CommitPolicy::Copy | CommitPolicy::Free);
    let (working_ha, fresh) = if must_copy_block {
        let new_block = if resolved == CommitPolicy::Free {
            cow_block_entire(txn.bpram, txn.blocks, &mut txn.shadow, txn.mode, ha.addr())?
        } else {
            cow_block(txn.bpram, txn.blocks, &mut txn.shadow, txn.mode, ha.addr())?
        };
        (Ha::new(ha.height(), new_block), true)
    } else {
        (ha, false)
    };
    write_children(
        txn,
        working_ha,
        fresh,
        child_span,
        first_child,
        last_child,
        off,
        size,
        valid,
        resolved,
        cb,
    )
}

#[allow(clippy::too_many_arguments)]
fn write_children(
    txn: &mut Txn,
    ha: Ha,
    already_fresh: bool,
    child_span: u64,
    first_child: u64,
    last_child: u64,
    off: u64,
    size: u64,
    valid: u64,
    resolved: CommitPolicy,
    cb: &mut LeafFn,
) -> Result<Ha> {
    let end = off + size;
    for slot in first_child..=last_child {
        let slot_start = slot * child_span;
        let sub_off = if slot == first_child { off - slot_start } else { 0 };
        let slot_end_in_range = end.min(slot_start + child_span);
        let sub_size = slot_end_in_range - (slot_start + sub_off);
        let sub_valid = valid.saturating_sub(slot_start).min(child_span);
        let child_policy = if already_fresh {
            CommitPolicy::Free
        } else {
            resolved
        };
        let old_child_addr = tree::read_indirect_slot(txn.bpram, ha.addr(), slot as usize);
        let child_height = ha.height() - 1;
        let old_child_ha = if old_child_addr.is_valid() {
            Ha::new(child_height, old_child_addr)
        } else {
            Ha::new(child_height, BlockNo::INVALID)
        };
        let new_child_ha = crawl_level(
            txn,
            old_child_ha,
            child_span,
            sub_off,
            sub_size,
            sub_valid,
            child_policy,
            cb,
        )?;
        if new_child_ha.addr() != old_child_addr {
            tree::write_indirect_slot(txn.bpram, ha.addr(), slot as usize, new_child_ha.addr());
        }
    }
    Ok(ha)
}

#[allow(clippy::too_many_arguments)]
fn crawl_leaf(
    txn: &mut Txn,
    ha: Ha,
    off: u64,
    size: u64,
    valid: u64,
    policy: CommitPolicy,
    cb: &mut LeafFn,
) -> Result<Ha> {
    let is_valid_range = off < valid;
    if ha.is_hole() {
        if policy == CommitPolicy::None {
            let mut scratch = [0u8; BLOCK_SIZE];
            cb(0, &mut scratch, off as usize, size as usize, false, policy)?;
            return Ok(ha);
        }
        let entire = off == 0 && size == BLOCK_SIZE as u64;
        let new_block = if entire {
            cow_block_entire(txn.bpram, txn.blocks, &mut txn.shadow, txn.mode, BlockNo::INVALID)?
        } else {
            cow_block_hole(txn.bpram, txn.blocks, &mut txn.shadow, txn.mode)?
        };
        cb(
            0,
            txn.bpram.block_mut(new_block),
            off as usize,
            size as usize,
            false,
            policy,
        )?;
        return Ok(Ha::new(0, new_block));
    }

    match policy {
        CommitPolicy::None => {
            let block = txn.bpram.block_mut(ha.addr());
            cb(0, block, off as usize, size as usize, is_valid_range, policy)?;
            Ok(ha)
        }
        CommitPolicy::Atomic | CommitPolicy::Free => {
            let block = txn.bpram.block_mut(ha.addr());
            cb(0, block, off as usize, size as usize, is_valid_range, policy)?;
            Ok(ha)
        }
        CommitPolicy::Copy => {
            let entire = off == 0 && size == BLOCK_SIZE as u64;
            let new_block = if entire {
                cow_block_entire(txn.bpram, txn.blocks, &mut txn.shadow, txn.mode, ha.addr())?
            } else {
                cow_block(txn.bpram, txn.blocks, &mut txn.shadow, txn.mode, ha.addr())?
            };
            cb(
                0,
                txn.bpram.block_mut(new_block),
                off as usize,
                size as usize,
                is_valid_range,
                policy,
            )?;
            Ok(Ha::new(0, new_block))
        }
    }
}

fn read_zero_range(
    span: u64,
    off: u64,
    size: u64,
    _valid: u64,
    cb: &mut LeafFn,
) -> Result<()> {
    let _ = span;
    let mut remaining = size;
    let mut cur = off;
    let mut scratch = [0u8; BLOCK_SIZE];
    while remaining > 0 {
        let in_block = (cur % BLOCK_SIZE as u64) as usize;
        let chunk = remaining.min((BLOCK_SIZE - in_block) as u64) as usize;
        let outcome = cb(cur - in_block as u64, &mut scratch, in_block, chunk, false, CommitPolicy::None)?;
        cur += chunk as u64;
        remaining -= chunk as u64;
        if outcome == CrawlOutcome::Stop {
            break;
        }
    }
    Ok(())
}

/// Enumerates the leaf block numbers covering `[off, off+size)`, skipping holes. Used by
/// `fsync` (nothing to flush beyond what is already durable in this hosted model, but a real
/// BPRAM target would `clflush` exactly these) and by `statfs`-style accounting.
pub fn crawl_blocknos(
    bpram: &Bpram,
    root: &TreeRoot,
    off: u64,
    size: u64,
    cb: &mut dyn FnMut(BlockNo) -> Result<()>,
) -> Result<()> {
    if size == 0 || root.ha.is_hole() {
        return Ok(());
    }
    let span = tree::max_nblocks(root.height()) * BLOCK_SIZE as u64;
    blocknos_level(bpram, root.ha, span, off.min(span), size.min(span.saturating_sub(off)), cb)
}

fn blocknos_level(
    bpram: &Bpram,
    ha: Ha,
    span: u64,
    off: u64,
    size: u64,
    cb: &mut dyn FnMut(BlockNo) -> Result<()>,
) -> Result<()> {
    if size == 0 || ha.is_hole() {
        return Ok(());
    }
    if ha.height() == 0 {
        return cb(ha.addr());
    }
    let child_span = span / ENTRIES_PER_IBLOCK;
    let first = off / child_span;
    let last = (off + size - 1) / child_span;
    for slot in first..=last {
        let slot_start = slot * child_span;
        let sub_off = if slot == first { off - slot_start } else { 0 };
        let sub_end = (off + size).min(slot_start + child_span);
        let sub_size = sub_end - (slot_start + sub_off);
        let child_addr = tree::read_indirect_slot(bpram, ha.addr(), slot as usize);
        if child_addr.is_valid() {
            blocknos_level(bpram, Ha::new(ha.height() - 1, child_addr), child_span, sub_off, sub_size, cb)?;
        }
    }
    Ok(())
}

/// Writes into several non-overlapping byte ranges of **one** tree through a single recursive
/// descent, so a batch of full-record overwrites (`inode::write_inodes`'s callers — both
/// `rename`'s touched parents, the moved child, and an overwritten destination) publishes
/// through one cascading CoW rather than one independent crawl per record (spec.md §4.4.4:
/// "reaching both target inodes in a single CoW path so a single atomic root update publishes
/// both mutations together"). Every region must fit within a single leaf block — true of every
/// caller here, since an inode record (128 bytes) never spans a 4096-byte block — so the
/// descent only ever needs to bucket regions by which child slot they fall into, never split
/// one region across two.
pub fn crawl_multi_write(txn: &mut Txn, root: &mut TreeRoot, writes: &[(u64, &[u8])]) -> Result<()> {
    if writes.is_empty() {
        return Ok(());
    }
    let end = writes.iter().map(|&(off, data)| off + data.len() as u64).max().unwrap();
    let policy = CommitPolicy::Copy.for_mode(txn.mode);
    let needed_height = tree::height_for(end.div_ceil(BLOCK_SIZE as u64).max(1));
    if needed_height > root.height() {
        *root = tree::change_height(txn, *root, needed_height)?;
    }
    let span = tree::max_nblocks(root.height()) * BLOCK_SIZE as u64;
    let idxs: Vec<usize> = (0..writes.len()).collect();
    let new_ha = crawl_multi_level(txn, root.ha, span, &idxs, writes, policy)?;
    root.ha = new_ha;
    if end > root.nbytes {
        root.nbytes = end;
    }
    Ok(())
}

/// Convenience entry point for the common two-region case — e.g. folding a rename's source-
/// and destination-parent directory records through one cascade.
pub fn crawl_data_2(
    txn: &mut Txn,
    root: &mut TreeRoot,
    off_a: u64,
    data_a: &[u8],
    off_b: u64,
    data_b: &[u8],
) -> Result<()> {
    crawl_multi_write(txn, root, &[(off_a, data_a), (off_b, data_b)])
}

fn crawl_multi_level(
    txn: &mut Txn,
    ha: Ha,
    span: u64,
    idxs: &[usize],
    writes: &[(u64, &[u8])],
    policy: CommitPolicy,
) -> Result<Ha> {
    if idxs.is_empty() {
        return Ok(ha);
    }
    if ha.height() == 0 {
        let new_ha = if ha.is_hole() {
            let new_block = cow_block_hole(txn.bpram, txn.blocks, &mut txn.shadow, txn.mode)?;
            Ha::new(0, new_block)
        } else if policy == CommitPolicy::Copy {
            let new_block = cow_block(txn.bpram, txn.blocks, &mut txn.shadow, txn.mode, ha.addr())?;
            Ha::new(0, new_block)
        } else {
            ha
        };
        let block = txn.bpram.block_mut(new_ha.addr());
        for &i in idxs {
            let (off, data) = writes[i];
            let in_block = (off % BLOCK_SIZE as u64) as usize;
            block[in_block..in_block + data.len()].copy_from_slice(data);
        }
        return Ok(new_ha);
    }

    let child_span = span / ENTRIES_PER_IBLOCK;
    let mut buckets: Vec<(u64, Vec<usize>)> = Vec::new();
    for &i in idxs {
        let slot = writes[i].0 / child_span;
        match buckets.iter_mut().find(|(s, _)| *s == slot) {
            Some(b) => b.1.push(i),
            None => buckets.push((slot, vec![i])),
        }
    }
    buckets.sort_by_key(|&(s, _)| s);
    let first_slot = buckets.first().unwrap().0;
    let last_slot = buckets.last().unwrap().0;
    let resolved = policy.descend(first_slot, last_slot, false);

    let (working_ha, already_fresh) = if ha.is_hole() {
        let new_block = cow_block_hole(txn.bpram, txn.blocks, &mut txn.shadow, txn.mode)?;
        (Ha::new(ha.height(), new_block), true)
    } else if matches!(resolved, CommitPolicy::Copy | CommitPolicy::Free) {
        let new_block = if resolved == CommitPolicy::Free {
            cow_block_entire(txn.bpram, txn.blocks, &mut txn.shadow, txn.mode, ha.addr())?
        } else {
            cow_block(txn.bpram, txn.blocks, &mut txn.shadow, txn.mode, ha.addr())?
        };
        (Ha::new(ha.height(), new_block), true)
    } else {
        (ha, false)
    };

    for (slot, group) in buckets {
        let old_child_addr = tree::read_indirect_slot(txn.bpram, working_ha.addr(), slot as usize);
        let child_height = working_ha.height() - 1;
        let old_child_ha = Ha::new(child_height, old_child_addr);
        let child_policy = if already_fresh { CommitPolicy::Free } else { resolved };
        let new_child_ha = crawl_multi_level(txn, old_child_ha, child_span, &group, writes, child_policy)?;
        if new_child_ha.addr() != old_child_addr {
            tree::write_indirect_slot(txn.bpram, working_ha.addr(), slot as usize, new_child_ha.addr());
        }
    }
    Ok(working_ha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::InodeAllocator;
    use crate::commit_policy::CommitMode;

    fn new_txn(bpram: &mut Bpram, blocks: &mut BlockAllocator, inodes: &mut InodeAllocator) -> Txn<'_> {
        Txn::new(bpram, blocks, inodes, CommitMode::Scsp)
    }

    #[test]
    fn write_then_read_small_range() {
        let mut bpram = Bpram::anon(64);
        let mut blocks = BlockAllocator::new(64);
        let mut inodes = InodeAllocator::new(8);
        let mut root = TreeRoot::EMPTY;
        {
            let mut txn = new_txn(&mut bpram, &mut blocks, &mut inodes);
            crawl_tree(&mut txn, &mut root, 10, 5, CommitPolicy::Copy, &mut |_bo, block, off, size, _valid, _p| {
                block[off..off + size].copy_from_slice(b"hello");
                Ok(CrawlOutcome::Continue)
            })
            .unwrap();
        }
        assert_eq!(root.nbytes, 15);
        let mut out = [0u8; 5];
        {
            let mut txn = new_txn(&mut bpram, &mut blocks, &mut inodes);
            crawl_tree(&mut txn, &mut root, 10, 5, CommitPolicy::None, &mut |_bo, block, off, size, _valid, _p| {
                out.copy_from_slice(&block[off..off + size]);
                Ok(CrawlOutcome::Continue)
            })
            .unwrap();
        }
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn read_hole_returns_zeros() {
        let mut bpram = Bpram::anon(64);
        let mut blocks = BlockAllocator::new(64);
        let mut inodes = InodeAllocator::new(8);
        let root = TreeRoot {
            ha: Ha::INVALID,
            nbytes: 4096,
        };
        let mut out = [0xFFu8; 16];
        let mut txn = new_txn(&mut bpram, &mut blocks, &mut inodes);
        crawl_tree_ro(&mut txn, &root, 0, 16, &mut |_bo, block, off, size, _valid, _p| {
            out.copy_from_slice(&block[off..off + size]);
            Ok(CrawlOutcome::Continue)
        })
        .unwrap();
        assert_eq!(out, [0u8; 16]);
    }

    #[test]
    fn write_spanning_multiple_leaves_grows_tree() {
        let mut bpram = Bpram::anon(2048);
        let mut blocks = BlockAllocator::new(2048);
        let mut inodes = InodeAllocator::new(8);
        let mut root = TreeRoot::EMPTY;
        let big = vec![0x7Au8; BLOCK_SIZE * 3];
        let mut txn = new_txn(&mut bpram, &mut blocks, &mut inodes);
        let mut written = 0usize;
        crawl_tree(&mut txn, &mut root, 0, big.len() as u64, CommitPolicy::Copy, &mut |_bo, block, off, size, _valid, _p| {
            block[off..off + size].copy_from_slice(&big[written..written + size]);
            written += size;
            Ok(CrawlOutcome::Continue)
        })
        .unwrap();
        assert_eq!(root.nbytes, big.len() as u64);
        assert!(root.height() >= 1);
    }
}
