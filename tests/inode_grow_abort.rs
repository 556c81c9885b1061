//! Exercises the inode table's grow-on-demand path (`bpramfs::inode::grow_table`) followed by
//! a transaction abort, confirming the inode bitmap's staged resize unwinds cleanly (spec.md
//! §9 open question: inode bitmap grown mid-operation that then aborts).

use bpramfs::alloc::{BlockAllocator, InodeAllocator};
use bpramfs::bpram::Bpram;
use bpramfs::commit_policy::CommitMode;
use bpramfs::{format, inode, txn::Txn};

#[test]
fn grow_table_then_abort_restores_prior_inode_capacity() {
    let mut bpram = Bpram::anon(256);
    let (mut sb, mut blocks, mut inodes) = format::mkbpfs(&mut bpram, 256, CommitMode::Scsp, 0).unwrap();

    let before_total = inodes.total();
    let before_bits = inodes.raw_bits().to_vec();

    {
        let mut txn = Txn::new(&mut bpram, &mut blocks, &mut inodes, sb.commit_mode);
        inode::grow_table(&mut txn, &mut sb).unwrap();
        assert_eq!(txn.inodes.total(), before_total * 2);
        // Simulate a later step in the same operation failing: abort rather than commit.
        txn.abort();
    }

    assert_eq!(inodes.total(), before_total);
    assert_eq!(inodes.raw_bits(), before_bits.as_slice());
}

#[test]
fn block_allocator_abort_after_allocation_restores_bits() {
    let mut bpram = Bpram::anon(64);
    let mut blocks = BlockAllocator::new(64);
    let mut inodes = InodeAllocator::new(8);
    let before_bits = blocks.raw_bits().to_vec();

    {
        let mut txn = Txn::new(&mut bpram, &mut blocks, &mut inodes, CommitMode::Scsp);
        let _ = txn.blocks.alloc_block().unwrap();
        let _ = txn.blocks.alloc_block().unwrap();
        txn.abort();
    }

    assert_eq!(blocks.raw_bits(), before_bits.as_slice());
}
