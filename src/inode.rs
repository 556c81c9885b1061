//! Inode records and the inode table (spec.md §3/§4.2), itself just another height-indexed
//! tree — rooted in the superblock rather than in a parent inode — walked with the same
//! `crate::crawler::crawl_tree` used for file data.

use crate::commit;
use crate::commit_policy::CommitPolicy;
use crate::crawler::{self, CrawlOutcome};
use crate::error::Result;
use crate::ha::TreeRoot;
use crate::stat::{FileType, Stat};
use crate::superblock::Superblock;
use crate::txn::Txn;

/// Packed record size; 32 records per 4096-byte block.
pub const INODE_SIZE: usize = 128;
pub const INODES_PER_BLOCK: u64 = 4096 / INODE_SIZE as u64;

const OFF_GENERATION: usize = 0;
const OFF_MODE: usize = 8;
const OFF_UID: usize = 10;
const OFF_GID: usize = 14;
const OFF_NLINKS: usize = 18;
const OFF_ROOT: usize = 24;
const OFF_ATIME: usize = 40;
const OFF_MTIME: usize = 48;
const OFF_CTIME: usize = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeNo(pub u64);

impl InodeNo {
    pub const INVALID: InodeNo = InodeNo(0);
    pub const ROOT: InodeNo = InodeNo(1);

    pub fn get(self) -> u64 {
        self.0
    }
}

/// A single filesystem object's metadata and data-tree root.
#[derive(Debug, Clone, Copy)]
pub struct Inode {
    pub generation: u64,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub nlinks: u32,
    pub root: TreeRoot,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl Inode {
    pub fn new(mode: u16, uid: u32, gid: u32, now: u64, generation: u64) -> Self {
        Self {
            generation,
            mode,
            uid,
            gid,
            nlinks: 1,
            root: TreeRoot::EMPTY,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    pub fn stat(&self) -> Stat {
        Stat {
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            nlinks: self.nlinks,
            size: self.root.nbytes,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }

    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    fn to_bytes(self) -> [u8; INODE_SIZE] {
        let mut b = [0u8; INODE_SIZE];
        b[OFF_GENERATION..OFF_GENERATION + 8].copy_from_slice(&self.generation.to_le_bytes());
        b[OFF_MODE..OFF_MODE + 2].copy_from_slice(&self.mode.to_le_bytes());
        b[OFF_UID..OFF_UID + 4].copy_from_slice(&self.uid.to_le_bytes());
        b[OFF_GID..OFF_GID + 4].copy_from_slice(&self.gid.to_le_bytes());
        b[OFF_NLINKS..OFF_NLINKS + 4].copy_from_slice(&self.nlinks.to_le_bytes());
        b[OFF_ROOT..OFF_ROOT + 16].copy_from_slice(&self.root.to_bytes());
        b[OFF_ATIME..OFF_ATIME + 8].copy_from_slice(&self.atime.to_le_bytes());
        b[OFF_MTIME..OFF_MTIME + 8].copy_from_slice(&self.mtime.to_le_bytes());
        b[OFF_CTIME..OFF_CTIME + 8].copy_from_slice(&self.ctime.to_le_bytes());
        b
    }

    fn from_bytes(b: &[u8]) -> Self {
        Self {
            generation: u64::from_le_bytes(b[OFF_GENERATION..OFF_GENERATION + 8].try_into().unwrap()),
            mode: u16::from_le_bytes(b[OFF_MODE..OFF_MODE + 2].try_into().unwrap()),
            uid: u32::from_le_bytes(b[OFF_UID..OFF_UID + 4].try_into().unwrap()),
            gid: u32::from_le_bytes(b[OFF_GID..OFF_GID + 4].try_into().unwrap()),
            nlinks: u32::from_le_bytes(b[OFF_NLINKS..OFF_NLINKS + 4].try_into().unwrap()),
            root: TreeRoot::from_bytes(&b[OFF_ROOT..OFF_ROOT + 16]),
            atime: u64::from_le_bytes(b[OFF_ATIME..OFF_ATIME + 8].try_into().unwrap()),
            mtime: u64::from_le_bytes(b[OFF_MTIME..OFF_MTIME + 8].try_into().unwrap()),
            ctime: u64::from_le_bytes(b[OFF_CTIME..OFF_CTIME + 8].try_into().unwrap()),
        }
    }
}

fn record_offset(ino: InodeNo) -> u64 {
    ino.get() * INODE_SIZE as u64
}

pub fn read_inode(txn: &mut Txn, sb: &Superblock, ino: InodeNo) -> Result<Inode> {
    let mut buf = [0u8; INODE_SIZE];
    crawler::crawl_tree_ro(txn, &sb.inode_root, record_offset(ino), INODE_SIZE as u64, &mut |_bo, block, o, s, _v, _p| {
        buf.copy_from_slice(&block[o..o + s]);
        Ok(CrawlOutcome::Continue)
    })?;
    Ok(Inode::from_bytes(&buf))
}

/// Rewrites an inode's full record into a caller-owned `table_root`, without publishing.
/// Always a `COPY`-policy leaf write (128 bytes can never collapse to a single atomic word).
/// Lets callers batch several inode writes (e.g. `rename`'s source- and destination-parent
/// records) through the same cascading CoW pass before publishing once — the crawler's
/// free-elision (`crate::cow`) means a second write into an already-freshly-copied ancestor
/// reuses it rather than copying again, so batched writes cost no more than one combined
/// cascade and commit as a single atomic unit.
pub fn write_inode_into(
    txn: &mut Txn,
    table_root: &mut TreeRoot,
    ino: InodeNo,
    inode: &Inode,
) -> Result<()> {
    let bytes = inode.to_bytes();
    crawler::crawl_tree(txn, table_root, record_offset(ino), INODE_SIZE as u64, CommitPolicy::Copy, &mut |_bo, block, o, s, _v, _p| {
        block[o..o + s].copy_from_slice(&bytes);
        Ok(CrawlOutcome::Continue)
    })
}

/// Rewrites one inode's full record and publishes immediately. [`write_inodes`] is the
/// multi-inode counterpart used when several records must commit as one unit.
pub fn write_inode(txn: &mut Txn, sb: &mut Superblock, ino: InodeNo, inode: &Inode) -> Result<()> {
    let mut table_root = sb.inode_root;
    let old_root = table_root;
    write_inode_into(txn, &mut table_root, ino, inode)?;
    commit::publish_super_root(txn, sb, old_root, table_root);
    Ok(())
}

/// Writes several inode records through the same inode-table cascade and publishes once, so
/// the whole batch commits (or, on an abort elsewhere in the caller's transaction, never
/// commits) as a single atomic unit — the mechanism `rename` and `unlink`'s
/// overwritten-target cleanup use to touch more than one inode consistently (spec.md §4.4.4).
/// The records are folded through [`crawler::crawl_multi_write`]'s single recursive descent
/// rather than one independent cascade per record, so two records sharing an indirect block
/// are CoW'd through it only once.
pub fn write_inodes(txn: &mut Txn, sb: &mut Superblock, writes: &[(InodeNo, Inode)]) -> Result<()> {
    let mut table_root = sb.inode_root;
    let old_root = table_root;
    let encoded: Vec<[u8; INODE_SIZE]> = writes.iter().map(|(_, inode)| inode.to_bytes()).collect();
    let regions: Vec<(u64, &[u8])> = writes
        .iter()
        .zip(encoded.iter())
        .map(|((ino, _), bytes)| (record_offset(*ino), bytes.as_slice()))
        .collect();
    crawler::crawl_multi_write(txn, &mut table_root, &regions)?;
    commit::publish_super_root(txn, sb, old_root, table_root);
    Ok(())
}

/// Doubles the inode table's record capacity by writing a blank record at the new high-water
/// mark, which forces the crawler to extend the tree, then resizes the staged bitmap to
/// match (spec.md §4.2 "inode allocator grows the inode tree on exhaustion").
pub fn grow_table(txn: &mut Txn, sb: &mut Superblock) -> Result<()> {
    let cur_capacity = (sb.inode_root.nbytes / INODE_SIZE as u64).max(INODES_PER_BLOCK);
    let new_capacity = cur_capacity * 2;
    let blank = [0u8; INODE_SIZE];
    let mut table_root = sb.inode_root;
    let old_root = table_root;
    let off = (new_capacity - 1) * INODE_SIZE as u64;
    crawler::crawl_tree(txn, &mut table_root, off, INODE_SIZE as u64, CommitPolicy::Copy, &mut |_bo, block, o, s, _v, _p| {
        block[o..o + s].copy_from_slice(&blank);
        Ok(CrawlOutcome::Continue)
    })?;
    commit::publish_super_root(txn, sb, old_root, table_root);
    txn.inodes.resize(new_capacity);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{BlockAllocator, InodeAllocator};
    use crate::bpram::Bpram;
    use crate::commit_policy::CommitMode;

    #[test]
    fn write_then_read_inode() {
        let mut bpram = Bpram::anon(256);
        let mut blocks = BlockAllocator::new(256);
        let mut inodes = InodeAllocator::new(64);
        let mut sb = Superblock::new(256, CommitMode::Bpfs, [0u8; 16]);
        let ino = InodeNo(1);
        let want = Inode::new(crate::stat::FileType::Regular.type_bits() | 0o644, 1000, 1000, 42, 0);
        {
            let mut txn = Txn::new(&mut bpram, &mut blocks, &mut inodes, CommitMode::Bpfs);
            write_inode(&mut txn, &mut sb, ino, &want).unwrap();
            txn.commit(&mut sb);
        }
        let mut txn = Txn::new(&mut bpram, &mut blocks, &mut inodes, CommitMode::Bpfs);
        let got = read_inode(&mut txn, &sb, ino).unwrap();
        assert_eq!(got.uid, 1000);
        assert_eq!(got.mode, want.mode);
    }
}
