//! Transaction handle: the borrow scope a single filesystem operation runs inside (spec.md
//! §4.7/§9 design notes).
//!
//! `Txn` bundles mutable access to the persistent medium and the two staged bitmap
//! allocators for the duration of one operation. It does not itself decide *when* writes
//! become durable — that is `crate::commit`'s job — but it owns the bookkeeping (the SCSP
//! shadow graph, the pending superblock image) that the commit step consumes. Every `Txn`
//! must be finalized by exactly one of `commit`/`abort`; both consume `self` so the borrow
//! checker rejects any attempt to keep using a finalized transaction.

use crate::alloc::{BlockAllocator, InodeAllocator};
use crate::bpram::Bpram;
use crate::commit::scsp::ShadowMap;
use crate::commit_policy::CommitMode;
use crate::ha::TreeRoot;
use crate::superblock::Superblock;

/// Bound on crawl recursion depth used to size fixed parent-tracking arrays: a file tree of
/// height `MAX_TREE_HEIGHT` nested below the inode tree of the same maximum height, plus the
/// superblock itself (spec.md §9 design note on the SCSP parent/child graph).
pub const MAX_PARENT_DEPTH: usize = 2 * crate::ha::MAX_TREE_HEIGHT as usize + 1;

pub struct Txn<'a> {
    pub bpram: &'a mut Bpram,
    pub blocks: &'a mut BlockAllocator,
    pub inodes: &'a mut InodeAllocator,
    pub mode: CommitMode,
    /// SCSP-only bookkeeping; unused (and always empty) outside `CommitMode::Scsp`.
    pub shadow: ShadowMap,
    /// Staged new value of the superblock's inode-table root, written by `crate::commit`'s
    /// publish helpers and consumed when the transaction commits. `None` means the inode
    /// tree root did not change.
    pending_inode_root: Option<TreeRoot>,
    /// Set once a mode-appropriate single atomic word has already been written to publish
    /// this transaction (SCSP/BPFS fast path). When set, `commit()` need not touch the
    /// superblock again.
    atomic_commit_done: bool,
}

impl<'a> Txn<'a> {
    pub fn new(
        bpram: &'a mut Bpram,
        blocks: &'a mut BlockAllocator,
        inodes: &'a mut InodeAllocator,
        mode: CommitMode,
    ) -> Self {
        Self {
            bpram,
            blocks,
            inodes,
            mode,
            shadow: ShadowMap::new(),
            pending_inode_root: None,
            atomic_commit_done: false,
        }
    }

    pub fn stage_inode_root(&mut self, new_root: TreeRoot) {
        self.pending_inode_root = Some(new_root);
    }

    pub fn mark_atomic_commit_done(&mut self) {
        self.atomic_commit_done = true;
    }

    /// Publishes any staged superblock change per the active commit mode, then promotes both
    /// allocators' staged bits to permanent.
    pub fn commit(mut self, sb: &mut Superblock) {
        log::trace!(
            "txn commit: mode={:?} pending_root={} atomic_done={}",
            self.mode,
            self.pending_inode_root.is_some(),
            self.atomic_commit_done
        );
        if let Some(new_root) = self.pending_inode_root.take() {
            match self.mode {
                CommitMode::Sp => {
                    // Spec.md §4.6: update the staged shadow field to match the primary, then
                    // overwrite both persistent copies with an epoch barrier between them, so
                    // an interruption anywhere in this sequence still leaves at least one
                    // persistent copy describing a fully consistent filesystem state.
                    sb.inode_root = new_root;
                    sb.inode_root_2 = new_root;
                    sb.write_primary(self.bpram);
                    self.bpram.epoch_barrier();
                    sb.write_shadow(self.bpram);
                    self.bpram.epoch_barrier();
                }
                CommitMode::Scsp | CommitMode::Bpfs => {
                    if !self.atomic_commit_done {
                        sb.inode_root = new_root;
                        sb.write_both(self.bpram);
                    }
                }
            }
        }
        self.blocks.commit();
        self.inodes.commit();
        self.shadow.clear();
    }

    /// Reverses every block/inode allocation and free staged during this transaction. Any
    /// bytes written into newly-allocated blocks are simply abandoned; they were never
    /// reachable from the committed tree.
    pub fn abort(mut self) {
        log::trace!("txn abort: mode={:?}", self.mode);
        self.blocks.abort();
        self.inodes.abort();
        self.shadow.clear();
    }
}
