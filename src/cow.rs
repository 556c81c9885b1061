//! Copy-on-write primitives the crawler calls at each tree level (spec.md §4.4.2/§4.5,
//! grounded on `examples/original_source/bpfs.c`'s `cow_block`/`cow_block_hole`).
//!
//! All three helpers elide the copy when `old` is already a block allocated earlier in the
//! same transaction (`BlockAllocator::freshly_alloced`): such a block is reachable from no
//! committed tree yet, so further writes to it never need to preserve a prior version.

use crate::alloc::BlockAllocator;
use crate::bpram::{BlockNo, Bpram};
use crate::commit::scsp::ShadowMap;
use crate::commit_policy::CommitMode;
use crate::error::Result;

/// Registers `old -> new` with the indirect-CoW module when running in SCSP mode, per spec.md
/// §4.5 ("All CoW allocations register the (old→new) mapping with the indirect-CoW module").
/// A no-op under SP/BPFS, whose commit paths never consult the shadow graph.
fn register_shadow(shadow: &mut ShadowMap, mode: CommitMode, old: BlockNo, new: BlockNo) {
    if mode == CommitMode::Scsp {
        shadow.record(old, new, None);
    }
}

/// Replaces `old` with a new block carrying the same contents, so the caller may mutate the
/// copy freely. Used when a write only partially covers the block (the untouched bytes must
/// survive).
pub fn cow_block(
    bpram: &mut Bpram,
    blocks: &mut BlockAllocator,
    shadow: &mut ShadowMap,
    mode: CommitMode,
    old: BlockNo,
) -> Result<BlockNo> {
    if old.is_valid() && blocks.freshly_alloced(old) {
        return Ok(old);
    }
    let new = blocks.alloc_block()?;
    if old.is_valid() {
        bpram.copy_block(old, new);
        blocks.free_block(old);
    } else {
        bpram.zero_block(new);
    }
    register_shadow(shadow, mode, old, new);
    Ok(new)
}

/// Replaces `old` with a fresh zeroed block, for materializing a hole that is about to be
/// written through entirely (no prior content to preserve).
pub fn cow_block_hole(
    bpram: &mut Bpram,
    blocks: &mut BlockAllocator,
    shadow: &mut ShadowMap,
    mode: CommitMode,
) -> Result<BlockNo> {
    let new = blocks.alloc_block()?;
    bpram.zero_block(new);
    register_shadow(shadow, mode, BlockNo::INVALID, new);
    Ok(new)
}

/// Replaces `old` with a new block without copying its contents, for writes that overwrite
/// the block in full. `old`, if valid, is freed immediately — its bytes are about to be
/// entirely superseded by the caller.
pub fn cow_block_entire(
    bpram: &mut Bpram,
    blocks: &mut BlockAllocator,
    shadow: &mut ShadowMap,
    mode: CommitMode,
    old: BlockNo,
) -> Result<BlockNo> {
    if old.is_valid() && blocks.freshly_alloced(old) {
        return Ok(old);
    }
    let new = blocks.alloc_block()?;
    bpram.zero_block(new);
    if old.is_valid() {
        blocks.free_block(old);
    }
    register_shadow(shadow, mode, old, new);
    Ok(new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cow_block_elides_copy_for_fresh_alloc() {
        let mut bpram = Bpram::anon(16);
        let mut blocks = BlockAllocator::new(16);
        let mut shadow = ShadowMap::new();
        let fresh = blocks.alloc_block().unwrap();
        let same = cow_block(&mut bpram, &mut blocks, &mut shadow, CommitMode::Scsp, fresh).unwrap();
        assert_eq!(fresh, same);
    }

    #[test]
    fn cow_block_preserves_contents() {
        let mut bpram = Bpram::anon(16);
        let mut blocks = BlockAllocator::new(16);
        let mut shadow = ShadowMap::new();
        let orig = blocks.alloc_block().unwrap();
        blocks.commit();
        bpram.block_mut(orig)[0] = 0xAB;
        let new = cow_block(&mut bpram, &mut blocks, &mut shadow, CommitMode::Scsp, orig).unwrap();
        assert_ne!(new, orig);
        assert_eq!(bpram.block(new)[0], 0xAB);
        assert_eq!(shadow.shadow_of(orig), Some(new));
    }
}
