//! The directory entry cache (spec.md §4.7), grounded on
//! `examples/original_source/dcache.c`/`dcache.h`: an LRU map keyed by directory inode
//! number, each entry caching the directory's name→[`MDirent`] mapping and a free-list of
//! holes big enough to host future entries.
//!
//! A cache entry is materialized on first access by crawling the whole directory once
//! (`ensure_materialized`) and evicted under fixed-size LRU pressure, mirroring the
//! original's `NMDIRS_MAX`-bounded `dcache`. The directory-parent map (".." resolution) is
//! kept separately, reference-counted by `lookup`/`forget` the way the original's VFS-level
//! dentry cache would be, since a single BPFS `mdirectory` does not itself track its own
//! parent.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use crate::dirent::{self, DirentView};
use crate::error::Result;
use crate::ha::TreeRoot;
use crate::inode::InodeNo;
use crate::stat::FileType;
use crate::txn::Txn;

/// Fixed cache capacity, matching the original's `NMDIRS_MAX`.
pub const NMDIRS_MAX: usize = 1024;

/// A cached name→inode mapping for one directory entry. Generation is not cached here —
/// callers needing generation (e.g. `lookup`'s full reply) re-read the target inode, since
/// they must anyway to fill the rest of its attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MDirent {
    pub offset: u64,
    pub ino: InodeNo,
    pub file_type: FileType,
}

#[derive(Debug, Clone, Copy)]
struct FreeSlot {
    offset: u64,
    len: u16,
}

#[derive(Debug, Default)]
struct CachedDir {
    by_name: HashMap<Vec<u8>, MDirent>,
    free: Vec<FreeSlot>,
}

#[derive(Debug, Clone, Copy)]
struct ParentEntry {
    parent: InodeNo,
    refcount: u32,
}

/// The directory entry cache plus the separate parent (".." resolution) map.
#[derive(Debug)]
pub struct DirCache {
    dirs: HashMap<InodeNo, CachedDir>,
    /// Most-recently-touched directory at the back.
    lru: VecDeque<InodeNo>,
    cap: usize,
    parents: HashMap<InodeNo, ParentEntry>,
}

impl DirCache {
    pub fn new() -> Self {
        Self::with_capacity(NMDIRS_MAX)
    }

    pub fn with_capacity(cap: usize) -> Self {
        assert!(cap >= 2, "dcache capacity must be at least 2 (required for rename)");
        Self {
            dirs: HashMap::new(),
            lru: VecDeque::new(),
            cap,
            parents: HashMap::new(),
        }
    }

    fn touch(&mut self, ino: InodeNo) {
        if let Some(pos) = self.lru.iter().position(|&i| i == ino) {
            self.lru.remove(pos);
        }
        self.lru.push_back(ino);
    }

    fn evict_oldest_except(&mut self, keep: &[InodeNo]) {
        while self.dirs.len() >= self.cap {
            let Some(pos) = self.lru.iter().position(|i| !keep.contains(i)) else {
                break;
            };
            let victim = self.lru.remove(pos).unwrap();
            self.dirs.remove(&victim);
        }
    }

    pub fn has_dir(&self, ino: InodeNo) -> bool {
        self.dirs.contains_key(&ino)
    }

    pub fn invalidate_dir(&mut self, ino: InodeNo) {
        self.dirs.remove(&ino);
        if let Some(pos) = self.lru.iter().position(|&i| i == ino) {
            self.lru.remove(pos);
        }
    }

    /// Ensures `parent`'s dcache entry exists, crawling its directory tree once if it is not
    /// already materialized. `keep_alive` names inodes (typically the two sides of a rename)
    /// that must not themselves be evicted while materializing this one.
    pub fn ensure_materialized(
        &mut self,
        txn: &mut Txn,
        parent: InodeNo,
        root: &TreeRoot,
        keep_alive: &[InodeNo],
    ) -> Result<()> {
        if self.dirs.contains_key(&parent) {
            self.touch(parent);
            return Ok(());
        }
        self.evict_oldest_except(keep_alive);
        let views: Vec<DirentView> = dirent::read_all(txn, root)?;
        let mut dir = CachedDir::default();
        for v in views {
            if v.is_free() {
                dir.free.push(FreeSlot {
                    offset: v.offset,
                    len: v.rec_len,
                });
            } else if v.name != b"." && v.name != b".." {
                let Some(ft) = v.file_type else { continue };
                dir.by_name.insert(
                    v.name,
                    MDirent {
                        offset: v.offset,
                        ino: v.ino,
                        file_type: ft,
                    },
                );
            }
        }
        self.dirs.insert(parent, dir);
        self.touch(parent);
        Ok(())
    }

    /// Looks up `name` inside an already-materialized `parent`. Panics (programming error)
    /// if `parent` was not materialized first, matching the original's `assert(mdir)`.
    pub fn get_dirent(&mut self, parent: InodeNo, name: &[u8]) -> Option<MDirent> {
        self.touch(parent);
        self.dirs
            .get(&parent)
            .expect("dcache: parent directory not materialized")
            .by_name
            .get(name)
            .copied()
    }

    /// First-fit over the cached hole list; returns the byte offset of a slot whose capacity
    /// is at least `min_len`, removing it from the free list.
    pub fn take_free(&mut self, parent: InodeNo, min_len: u16) -> Option<u64> {
        let dir = self.dirs.get_mut(&parent)?;
        let pos = dir.free.iter().position(|f| f.len >= min_len)?;
        Some(dir.free.remove(pos).offset)
    }

    pub fn add_free(&mut self, parent: InodeNo, offset: u64, len: u16) {
        if let Some(dir) = self.dirs.get_mut(&parent) {
            dir.free.push(FreeSlot { offset, len });
        }
    }

    /// Records a newly-published dirent, keeping the cache consistent with on-medium state.
    pub fn add_dirent(&mut self, parent: InodeNo, name: &[u8], md: MDirent) {
        self.touch(parent);
        if let Some(dir) = self.dirs.get_mut(&parent) {
            dir.by_name.insert(name.to_vec(), md);
        }
    }

    /// Removes `name` from `parent`'s cache, releasing its slot onto the free list.
    pub fn rem_dirent(&mut self, parent: InodeNo, name: &[u8]) {
        self.touch(parent);
        if let Some(dir) = self.dirs.get_mut(&parent) {
            if let Some(md) = dir.by_name.remove(name) {
                let need = dirent_rec_len(name.len());
                dir.free.push(FreeSlot {
                    offset: md.offset,
                    len: need,
                });
            }
        }
    }

    // Parent map (".." resolution), reference-counted by lookup/forget.

    /// Records (or bumps the refcount of) `child`'s parent. The root directory is its own
    /// parent and is never evicted by `forget`.
    pub fn remember_parent(&mut self, child: InodeNo, parent: InodeNo) {
        match self.parents.entry(child) {
            Entry::Occupied(mut e) => {
                let v = e.get_mut();
                debug_assert_eq!(v.parent, parent, "child's parent changed without a rename");
                v.refcount += 1;
            }
            Entry::Vacant(e) => {
                e.insert(ParentEntry { parent, refcount: 1 });
            }
        }
    }

    pub fn parent_of(&self, child: InodeNo) -> Option<InodeNo> {
        if child == InodeNo::ROOT {
            return Some(InodeNo::ROOT);
        }
        self.parents.get(&child).map(|e| e.parent)
    }

    /// Re-parents `child` after a rename moved it under a new directory.
    pub fn reparent(&mut self, child: InodeNo, new_parent: InodeNo) {
        if let Some(e) = self.parents.get_mut(&child) {
            e.parent = new_parent;
        }
    }

    /// Drops one reference to `child`'s parent entry, per `forget`'s reference-counted
    /// lifetime (spec.md §4.7).
    pub fn forget(&mut self, child: InodeNo, count: u32) {
        if let Entry::Occupied(mut e) = self.parents.entry(child) {
            let v = e.get_mut();
            v.refcount = v.refcount.saturating_sub(count);
            if v.refcount == 0 {
                e.remove();
            }
        }
    }
}

impl Default for DirCache {
    fn default() -> Self {
        Self::new()
    }
}

fn dirent_rec_len(name_len: usize) -> u16 {
    ((dirent::DIRENT_HEADER_LEN + name_len).div_ceil(dirent::DIRENT_ALIGN) * dirent::DIRENT_ALIGN) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{BlockAllocator, InodeAllocator};
    use crate::bpram::Bpram;
    use crate::commit_policy::CommitMode;

    #[test]
    fn materialize_then_lookup() {
        let mut bpram = Bpram::anon(64);
        let mut blocks = BlockAllocator::new(64);
        let mut inodes = InodeAllocator::new(8);
        let mut root = TreeRoot::EMPTY;
        let mut txn = Txn::new(&mut bpram, &mut blocks, &mut inodes, CommitMode::Scsp);
        dirent::add(&mut txn, &mut root, InodeNo(5), FileType::Regular, b"f").unwrap();

        let mut dc = DirCache::new();
        dc.ensure_materialized(&mut txn, InodeNo::ROOT, &root, &[]).unwrap();
        let md = dc.get_dirent(InodeNo::ROOT, b"f").unwrap();
        assert_eq!(md.ino, InodeNo(5));
        assert!(dc.get_dirent(InodeNo::ROOT, b"missing").is_none());
    }

    #[test]
    fn lru_eviction_respects_keep_alive() {
        let mut dc = DirCache::with_capacity(2);
        let mut bpram = Bpram::anon(64);
        let mut blocks = BlockAllocator::new(64);
        let mut inodes = InodeAllocator::new(8);
        let root = TreeRoot::EMPTY;
        let mut txn = Txn::new(&mut bpram, &mut blocks, &mut inodes, CommitMode::Scsp);
        dc.ensure_materialized(&mut txn, InodeNo(1), &root, &[]).unwrap();
        dc.ensure_materialized(&mut txn, InodeNo(2), &root, &[]).unwrap();
        dc.ensure_materialized(&mut txn, InodeNo(3), &root, &[InodeNo(1)]).unwrap();
        assert!(dc.has_dir(InodeNo(1)));
        assert!(!dc.has_dir(InodeNo(2)));
        assert!(dc.has_dir(InodeNo(3)));
    }

    #[test]
    fn parent_refcounting() {
        let mut dc = DirCache::new();
        dc.remember_parent(InodeNo(5), InodeNo::ROOT);
        dc.remember_parent(InodeNo(5), InodeNo::ROOT);
        assert_eq!(dc.parent_of(InodeNo(5)), Some(InodeNo::ROOT));
        dc.forget(InodeNo(5), 1);
        assert_eq!(dc.parent_of(InodeNo(5)), Some(InodeNo::ROOT));
        dc.forget(InodeNo(5), 1);
        assert_eq!(dc.parent_of(InodeNo(5)), None);
    }
}
