//! Directory entry records (spec.md §3/§4.2) and the scan helpers built on them.
//!
//! A directory is an ordinary file whose data tree holds a packed sequence of variable
//! length records, each starting on an 8-byte boundary so that removing an entry (zeroing its
//! `ino` field) is always a single atomic word write — the same trick ext2-style filesystems
//! use, adapted here so tombstoning survives under every commit mode, not just BPFS/SCSP.

use crate::bpram::BLOCK_SIZE;
use crate::commit_policy::CommitPolicy;
use crate::crawler::{self, CrawlOutcome};
use crate::error::{Error, Result};
use crate::ha::TreeRoot;
use crate::inode::InodeNo;
use crate::stat::FileType;
use crate::txn::Txn;

pub const DIRENT_ALIGN: usize = 8;
pub const DIRENT_HEADER_LEN: usize = 12;
pub const MAX_NAME_LEN: usize = 255;

fn padded_len(name_len: usize) -> usize {
    (DIRENT_HEADER_LEN + name_len).div_ceil(DIRENT_ALIGN) * DIRENT_ALIGN
}

fn type_tag(ft: FileType) -> u8 {
    match ft {
        FileType::Regular => 1,
        FileType::Directory => 2,
        FileType::Link => 3,
        FileType::BlockDevice => 4,
        FileType::CharDevice => 5,
        FileType::Fifo => 6,
        FileType::Socket => 7,
    }
}

fn type_from_tag(tag: u8) -> Option<FileType> {
    match tag {
        1 => Some(FileType::Regular),
        2 => Some(FileType::Directory),
        3 => Some(FileType::Link),
        4 => Some(FileType::BlockDevice),
        5 => Some(FileType::CharDevice),
        6 => Some(FileType::Fifo),
        7 => Some(FileType::Socket),
        _ => None,
    }
}

/// A decoded view into one record of a directory's byte stream.
#[derive(Debug, Clone)]
pub struct DirentView {
    pub offset: u64,
    pub rec_len: u16,
    pub ino: InodeNo,
    pub file_type: Option<FileType>,
    pub name: Vec<u8>,
}

impl DirentView {
    pub fn is_free(&self) -> bool {
        self.ino == InodeNo::INVALID
    }
}

fn encode(ino: InodeNo, ft: FileType, name: &[u8], rec_len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; rec_len];
    buf[0..8].copy_from_slice(&ino.get().to_le_bytes());
    buf[8..10].copy_from_slice(&(rec_len as u16).to_le_bytes());
    buf[10] = type_tag(ft);
    buf[11] = name.len() as u8;
    buf[DIRENT_HEADER_LEN..DIRENT_HEADER_LEN + name.len()].copy_from_slice(name);
    buf
}

fn decode(offset: u64, raw: &[u8]) -> DirentView {
    let ino = u64::from_le_bytes(raw[0..8].try_into().unwrap());
    let rec_len = u16::from_le_bytes(raw[8..10].try_into().unwrap());
    let file_type = type_from_tag(raw[10]);
    let name_len = raw[11] as usize;
    let name = raw[DIRENT_HEADER_LEN..DIRENT_HEADER_LEN + name_len].to_vec();
    DirentView {
        offset,
        rec_len,
        ino: InodeNo(ino),
        file_type,
        name,
    }
}

/// Reads an entire directory's contents into memory and decodes every record, including
/// tombstoned (free) ones. Directories are expected to stay small enough for this to be
/// cheap; spec.md's non-goals exclude large-directory indexing.
pub fn read_all(txn: &mut Txn, root: &TreeRoot) -> Result<Vec<DirentView>> {
    let len = root.nbytes;
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; len as usize];
    crawler::crawl_tree_ro(txn, root, 0, len, &mut |bo, block, o, s, _v, _p| {
        let abs = bo as usize + o;
        buf[abs..abs + s].copy_from_slice(&block[o..o + s]);
        Ok(CrawlOutcome::Continue)
    })?;
    let mut out = Vec::new();
    let mut off = 0u64;
    while off < len {
        let view = decode(off, &buf[off as usize..]);
        if view.rec_len == 0 {
            // Entries never cross block boundaries (spec.md §3): a zero `rec_len` marks the
            // unused tail of the current block, not end-of-directory, so skip to the next one.
            let next_block = (off / BLOCK_SIZE as u64 + 1) * BLOCK_SIZE as u64;
            if next_block <= off {
                break;
            }
            off = next_block;
            continue;
        }
        off += view.rec_len as u64;
        out.push(view);
    }
    Ok(out)
}

pub fn lookup(txn: &mut Txn, root: &TreeRoot, name: &[u8]) -> Result<Option<DirentView>> {
    Ok(read_all(txn, root)?
        .into_iter()
        .find(|e| !e.is_free() && e.name == name))
}

/// Appends `name -> ino` to a directory, reusing the first free record of adequate size if
/// one exists, or padding out to the next block boundary first if a fresh record would
/// otherwise straddle one. Returns the byte offset the record was written at (so callers can
/// keep a directory-entry cache in sync without a second scan) and [`Error::Exists`] if the
/// name is already present or [`Error::NameTooLong`] if it exceeds [`MAX_NAME_LEN`].
pub fn add(
    txn: &mut Txn,
    root: &mut TreeRoot,
    ino: InodeNo,
    ft: FileType,
    name: &[u8],
) -> Result<u64> {
    if name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong);
    }
    let need = padded_len(name.len());
    let entries = read_all(txn, root)?;
    for e in &entries {
        if !e.is_free() && e.name == name {
            return Err(Error::Exists);
        }
    }
    if let Some(slot) = entries.iter().find(|e| e.is_free() && e.rec_len as usize >= need) {
        let offset = slot.offset;
        let bytes = encode(ino, ft, name, slot.rec_len as usize);
        crawler::crawl_tree(txn, root, offset, slot.rec_len as u64, CommitPolicy::Copy, &mut |_bo, block, o, s, _v, _p| {
            block[o..o + s].copy_from_slice(&bytes);
            Ok(CrawlOutcome::Continue)
        })?;
        return Ok(offset);
    }
    // A fresh record must never straddle a block boundary (spec.md §3). If it would not fit
    // in what remains of the current block, skip ahead to the next block first — the bytes
    // in between stay a zeroed, implicit `rec_len == 0` terminator for the skipped block.
    let remaining_in_block = BLOCK_SIZE as u64 - root.nbytes % BLOCK_SIZE as u64;
    let off = if need as u64 > remaining_in_block {
        root.nbytes + remaining_in_block
    } else {
        root.nbytes
    };
    let bytes = encode(ino, ft, name, need);
    crawler::crawl_tree(txn, root, off, need as u64, CommitPolicy::Copy, &mut |_bo, block, o, s, _v, _p| {
        block[o..o + s].copy_from_slice(&bytes);
        Ok(CrawlOutcome::Continue)
    })?;
    Ok(off)
}

/// Removes `name`, tombstoning its record by zeroing the `ino` field — a single atomic
/// 8-byte word write under every commit mode, since record headers are always 8-byte
/// aligned.
pub fn remove(txn: &mut Txn, root: &mut TreeRoot, name: &[u8]) -> Result<InodeNo> {
    let entries = read_all(txn, root)?;
    let entry = entries
        .into_iter()
        .find(|e| !e.is_free() && e.name == name)
        .ok_or(Error::NotFound)?;
    let zero = 0u64.to_le_bytes();
    crawler::crawl_tree(txn, root, entry.offset, 8, CommitPolicy::Atomic, &mut |_bo, block, o, s, _v, _p| {
        block[o..o + s].copy_from_slice(&zero);
        Ok(CrawlOutcome::Continue)
    })?;
    Ok(entry.ino)
}

/// Repoints an existing record to a new inode (used by `rename` onto an existing target, and
/// by `link`'s sibling paths). The `ino` field alone changes, so this is also a single atomic
/// word write.
pub fn retarget(txn: &mut Txn, root: &mut TreeRoot, name: &[u8], new_ino: InodeNo) -> Result<InodeNo> {
    let entries = read_all(txn, root)?;
    let entry = entries
        .into_iter()
        .find(|e| !e.is_free() && e.name == name)
        .ok_or(Error::NotFound)?;
    let bytes = new_ino.get().to_le_bytes();
    crawler::crawl_tree(txn, root, entry.offset, 8, CommitPolicy::Atomic, &mut |_bo, block, o, s, _v, _p| {
        block[o..o + s].copy_from_slice(&bytes);
        Ok(CrawlOutcome::Continue)
    })?;
    Ok(entry.ino)
}

pub fn is_empty(txn: &mut Txn, root: &TreeRoot) -> Result<bool> {
    Ok(read_all(txn, root)?.into_iter().all(|e| {
        e.is_free() || e.name == b"." || e.name == b".."
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{BlockAllocator, InodeAllocator};
    use crate::bpram::Bpram;
    use crate::commit_policy::CommitMode;

    #[test]
    fn add_lookup_remove_roundtrip() {
        let mut bpram = Bpram::anon(64);
        let mut blocks = BlockAllocator::new(64);
        let mut inodes = InodeAllocator::new(8);
        let mut root = TreeRoot::EMPTY;
        let mut txn = Txn::new(&mut bpram, &mut blocks, &mut inodes, CommitMode::Scsp);
        add(&mut txn, &mut root, InodeNo(5), FileType::Regular, b"hello.txt").unwrap();
        let found = lookup(&mut txn, &root, b"hello.txt").unwrap().unwrap();
        assert_eq!(found.ino, InodeNo(5));
        let removed = remove(&mut txn, &mut root, b"hello.txt").unwrap();
        assert_eq!(removed, InodeNo(5));
        assert!(lookup(&mut txn, &root, b"hello.txt").unwrap().is_none());
    }

    #[test]
    fn add_duplicate_name_errors() {
        let mut bpram = Bpram::anon(64);
        let mut blocks = BlockAllocator::new(64);
        let mut inodes = InodeAllocator::new(8);
        let mut root = TreeRoot::EMPTY;
        let mut txn = Txn::new(&mut bpram, &mut blocks, &mut inodes, CommitMode::Scsp);
        add(&mut txn, &mut root, InodeNo(5), FileType::Regular, b"a").unwrap();
        let err = add(&mut txn, &mut root, InodeNo(6), FileType::Regular, b"a").unwrap_err();
        assert!(matches!(err, Error::Exists));
    }
}
