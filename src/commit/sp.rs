//! Double-superblock shadow paging: mount-time recovery (spec.md §4.6, §9 Open Question 1).
//!
//! SP mode never writes into a live, already-referenced block — `CommitPolicy::Atomic`
//! collapses to `Copy` for the whole filesystem (`commit_policy::CommitPolicy::for_mode`), so
//! every transaction's commit reduces to one act: write the new superblock (carrying the new
//! inode-table root) to block 1, barrier, then to block 2. A crash between the two copies
//! leaves block 1 authoritative and block 2 stale; recovery simply re-mirrors block 1 over
//! block 2 rather than attempting to reconcile the two.

use crate::bpram::Bpram;
use crate::superblock::Superblock;

/// Reads both superblock copies and resolves which is authoritative after an unclean
/// shutdown. Returns the recovered, already-resynced superblock.
pub fn recover(bpram: &mut Bpram) -> Option<Superblock> {
    let primary = Superblock::read_primary(bpram);
    let shadow = Superblock::read_shadow(bpram);
    let sb = match (primary, shadow) {
        (Some(p), _) if p.is_valid_magic() => p,
        (_, Some(s)) if s.is_valid_magic() => s,
        _ => return None,
    };
    sb.write_both(bpram);
    bpram.epoch_barrier();
    Some(sb)
}
