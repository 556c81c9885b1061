//! Mode-specific publication of a changed tree root (spec.md §4.4.3/§4.6).
//!
//! The crawler (`crate::crawler`) only ever produces a new [`TreeRoot`] value for whichever
//! tree it walked; it never decides how that value reaches the structure that owns it. That
//! decision — single in-place atomic word, or cascading shadow of the owner followed by the
//! next level's own publish — lives here, parameterized by [`CommitMode`].

pub mod bpfs;
pub mod scsp;
pub mod sp;

use crate::bpram::BlockNo;
use crate::commit_policy::CommitMode;
use crate::ha::TreeRoot;
use crate::superblock::Superblock;
use crate::txn::Txn;

/// Publishes a change to the filesystem-wide inode-table root. This is the base case every
/// cascading root update eventually reaches (spec.md §4.4.3's "shadow the enclosing block"
/// chain bottoms out at the superblock).
///
/// `ha_only` indicates the root's `addr`/`height` changed but `nbytes` did not, which is
/// exactly the condition under which SCSP/BPFS may publish with a single atomic 8-byte store
/// instead of staging a full superblock rewrite.
pub fn publish_super_root(txn: &mut Txn, sb: &mut Superblock, old: TreeRoot, new: TreeRoot) {
    if old == new {
        return;
    }
    let ha_only = old.nbytes == new.nbytes;
    match txn.mode {
        CommitMode::Sp => {
            // ATOMIC always collapses to COPY under SP (commit_policy::for_mode), so SP never
            // takes the in-place path here; every change is staged for the dual-copy rewrite.
            // `sb.inode_root` is updated in memory right away (the on-medium copies still wait
            // for `Txn::commit`) so a second inode write later in the same transaction builds
            // on this one instead of starting over from the pre-transaction root; callers that
            // abort must restore their own snapshot of `sb` since nothing durable happened yet.
            txn.stage_inode_root(new);
            sb.inode_root = new;
        }
        CommitMode::Scsp | CommitMode::Bpfs => {
            if ha_only {
                write_ha_word(txn, BlockNo::SUPER, super_ha_offset(), new);
                write_ha_word(txn, BlockNo::SUPER_2, super_ha_offset(), new);
                sb.inode_root = new;
                txn.mark_atomic_commit_done();
            } else {
                txn.stage_inode_root(new);
                sb.inode_root = new;
            }
        }
    }
}

const fn super_ha_offset() -> usize {
    32 // Superblock::OFF_INODE_ROOT; kept in sync by the roundtrip test in superblock.rs.
}

fn write_ha_word(txn: &mut Txn, block: BlockNo, offset: usize, new: TreeRoot) {
    let buf = txn.bpram.block_mut(block);
    buf[offset..offset + 8].copy_from_slice(&new.ha.to_raw().to_le_bytes());
}
