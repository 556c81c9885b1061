//! The POSIX-shaped operation surface (spec.md §4.8/§6): the single entry point
//! (`BpramFs`) that owns the mounted filesystem and dispatches one handler at a time.
//!
//! Every handler here follows the same shape: read whatever inodes/dirents it needs inside a
//! `Txn`, mutate through `crate::tree`/`crate::dirent`/`crate::inode`, and either commit or
//! abort depending on the result. The free functions below (`lookup_logic`, `rename_logic`,
//! ...) hold the actual per-operation logic; `BpramFs`'s methods are thin wrappers that open
//! the transaction, call the matching logic function, and finalize it — grounded on the
//! split between `maestro`'s `NodeOps`/`FileOps` trait methods and the VFS layer that commits
//! their result (`examples/maestro-os-maestro/kernel/src/file/fs/ext2/mod.rs`).

use std::cell::Cell;
use std::fs::File;
use std::io;
use std::marker::PhantomData;

use crate::alloc::{BlockAllocator, InodeAllocator};
use crate::bpram::{Bpram, BLOCK_SIZE};
use crate::commit_policy::CommitMode;
use crate::config::Config;
use crate::crawler::{self, CrawlOutcome};
use crate::dcache::{DirCache, MDirent};
use crate::dirent::{self, MAX_NAME_LEN};
use crate::error::{Error, Result};
use crate::format;
use crate::ha::TreeRoot;
use crate::inode::{self, Inode, InodeNo};
use crate::mount;
use crate::stat::{FileType, Stat};
use crate::superblock::Superblock;
use crate::tree;
use crate::txn::Txn;

/// A file or directory's identity and attributes as surfaced across the operation
/// surface (spec.md §6: "inode numbers and a per-inode generation identify files").
#[derive(Debug, Clone, Copy)]
pub struct NodeAttr {
    pub ino: InodeNo,
    pub generation: u64,
    pub stat: Stat,
}

/// The fields `setattr` may change; `None` leaves a field untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mode: Option<u16>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
}

/// `statfs` reply (spec.md §4.8 expansion, grounded on `original_source/bpfs.c`'s
/// `bpfs_statfs`).
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub block_size: u32,
    pub max_name_len: u32,
}

/// One decoded `readdir` entry, including the synthesized `.`/`..` pair.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub ino: InodeNo,
    pub file_type: FileType,
}

/// The mounted filesystem. Owns the BPRAM mapping, the durable superblock mirror, both staged
/// bitmap allocators and the directory-entry cache; dispatches exactly one operation at a
/// time to completion (spec.md §5).
///
/// `!Sync` by construction, mirroring how `maestro` leans on its `Spin` lock types to make a
/// concurrency discipline a compile-time property rather than only a documented convention
/// (spec.md §5 expansion) — nothing here actually needs interior mutability, so the marker
/// field alone carries that guarantee.
pub struct BpramFs {
    bpram: Bpram,
    sb: Superblock,
    blocks: BlockAllocator,
    inodes: InodeAllocator,
    dcache: DirCache,
    config: Config,
    ops_since_check: u64,
    _not_sync: PhantomData<Cell<()>>,
}

impl BpramFs {
    fn assemble(bpram: Bpram, sb: Superblock, blocks: BlockAllocator, inodes: InodeAllocator, config: Config) -> Self {
        Self {
            bpram,
            sb,
            blocks,
            inodes,
            dcache: DirCache::with_capacity(config.dcache_capacity),
            config,
            ops_since_check: 0,
            _not_sync: PhantomData,
        }
    }

    /// Formats a brand-new filesystem over an anonymous, process-private region — the first
    /// of the two startup forms named in spec.md §6.
    pub fn format_in_memory(nblocks: u64, commit_mode: CommitMode, now: u64) -> Result<Self> {
        let (bpram, sb, blocks, inodes) = mount::mount_anon(nblocks, commit_mode, now)?;
        Ok(Self::assemble(bpram, sb, blocks, inodes, Config::from_env()))
    }

    /// Formats a brand-new filesystem over a file-backed mapping, sized to `nblocks` blocks.
    pub fn format_file(file: &File, nblocks: u64, commit_mode: CommitMode, now: u64) -> Result<Self> {
        let mut bpram = Bpram::map_file(file).map_err(|_| Error::InvalidArgument)?;
        let (sb, blocks, inodes) = format::mkbpfs(&mut bpram, nblocks, commit_mode, now)?;
        Ok(Self::assemble(bpram, sb, blocks, inodes, Config::from_env()))
    }

    /// Attaches to an existing BPRAM file, recovering the superblock and rebuilding both
    /// bitmaps from a live scan — the second startup form of spec.md §6.
    pub fn mount(file: &File) -> Result<Self> {
        let mut bpram = Bpram::map_file(file).map_err(|_| Error::InvalidArgument)?;
        let (sb, blocks, inodes) = mount::mount(&mut bpram)?;
        Ok(Self::assemble(bpram, sb, blocks, inodes, Config::from_env()))
    }

    /// Marks the filesystem cleanly unmounted and releases it. Any further use of `self`
    /// after this would be a logic error, so this consumes `self`.
    pub fn destroy(mut self) {
        mount::unmount(&mut self.bpram, &mut self.sb);
    }

    /// Runs `f` inside a fresh transaction over the live allocators, then commits on success
    /// or aborts and rolls `sb` back to its pre-transaction value on failure.
    ///
    /// `sb` may be mutated by `f` (via `crate::commit::publish_super_root`'s optimistic
    /// in-memory sync) before the transaction actually durably commits; restoring the
    /// snapshot on error is what keeps that safe to do.
    fn transact<T>(
        &mut self,
        f: impl FnOnce(&mut Txn, &mut Superblock, &mut DirCache) -> Result<T>,
    ) -> Result<T> {
        let Self {
            bpram,
            sb,
            blocks,
            inodes,
            dcache,
            ..
        } = self;
        let saved_sb = *sb;
        let mut txn = Txn::new(bpram, blocks, inodes, sb.commit_mode);
        match f(&mut txn, sb, dcache) {
            Ok(v) => {
                txn.commit(sb);
                self.maybe_check_consistency();
                Ok(v)
            }
            Err(e) => {
                txn.abort();
                *sb = saved_sb;
                Err(e)
            }
        }
    }

    fn maybe_check_consistency(&mut self) {
        let interval = self.config.consistency_check_interval;
        if interval == 0 {
            return;
        }
        self.ops_since_check += 1;
        if self.ops_since_check < interval {
            return;
        }
        self.ops_since_check = 0;
        if let Err(e) = mount::check_consistency(&mut self.bpram, &self.blocks, &self.inodes, &self.sb) {
            panic!("bpramfs: consistency check failed: {e}");
        }
    }

    pub fn statfs(&self) -> StatFs {
        StatFs {
            total_blocks: self.sb.nblocks,
            free_blocks: self.blocks.free_count(),
            total_inodes: self.inodes.total(),
            free_inodes: self.inodes.free_count(),
            block_size: BLOCK_SIZE as u32,
            max_name_len: MAX_NAME_LEN as u32,
        }
    }

    pub fn lookup(&mut self, parent: InodeNo, name: &[u8]) -> Result<NodeAttr> {
        self.transact(|txn, sb, dcache| lookup_logic(txn, sb, dcache, parent, name))
    }

    pub fn forget(&mut self, ino: InodeNo, nlookup: u32) {
        self.dcache.forget(ino, nlookup);
    }

    pub fn getattr(&mut self, ino: InodeNo) -> Result<NodeAttr> {
        self.transact(|txn, sb, _dcache| {
            let rec = inode::read_inode(txn, sb, ino)?;
            Ok(NodeAttr {
                ino,
                generation: rec.generation,
                stat: rec.stat(),
            })
        })
    }

    pub fn setattr(&mut self, ino: InodeNo, attr: &SetAttr, now: u64) -> Result<NodeAttr> {
        log::debug!("setattr(ino={:?}, size={:?})", ino, attr.size);
        self.transact(|txn, sb, _dcache| setattr_logic(txn, sb, ino, attr, now))
    }

    pub fn readlink(&mut self, ino: InodeNo) -> Result<Vec<u8>> {
        self.transact(|txn, sb, _dcache| readlink_logic(txn, sb, ino))
    }

    fn create_typed(
        &mut self,
        parent: InodeNo,
        name: &[u8],
        ft: FileType,
        perm: u16,
        uid: u32,
        gid: u32,
        now: u64,
        symlink_target: Option<&[u8]>,
    ) -> Result<NodeAttr> {
        let mode = ft.type_bits() | (perm & 0o7777);
        self.transact(|txn, sb, dcache| {
            create_child_logic(txn, sb, dcache, parent, name, mode, uid, gid, now, symlink_target)
        })
    }

    pub fn mknod(&mut self, parent: InodeNo, name: &[u8], ft: FileType, perm: u16, uid: u32, gid: u32, now: u64) -> Result<NodeAttr> {
        match ft {
            FileType::Directory => Err(Error::InvalidArgument),
            FileType::Link => Err(Error::InvalidArgument),
            FileType::BlockDevice | FileType::CharDevice => Err(Error::NotSupported),
            _ => self.create_typed(parent, name, ft, perm, uid, gid, now, None),
        }
    }

    pub fn mkdir(&mut self, parent: InodeNo, name: &[u8], perm: u16, uid: u32, gid: u32, now: u64) -> Result<NodeAttr> {
        self.create_typed(parent, name, FileType::Directory, perm, uid, gid, now, None)
    }

    pub fn create(&mut self, parent: InodeNo, name: &[u8], perm: u16, uid: u32, gid: u32, now: u64) -> Result<NodeAttr> {
        self.create_typed(parent, name, FileType::Regular, perm, uid, gid, now, None)
    }

    pub fn symlink(&mut self, parent: InodeNo, name: &[u8], target: &[u8], uid: u32, gid: u32, now: u64) -> Result<NodeAttr> {
        self.create_typed(parent, name, FileType::Link, 0o777, uid, gid, now, Some(target))
    }

    pub fn unlink(&mut self, parent: InodeNo, name: &[u8], now: u64) -> Result<()> {
        log::debug!("unlink(parent={:?}, name={:?})", parent, String::from_utf8_lossy(name));
        self.transact(|txn, sb, dcache| unlink_logic(txn, sb, dcache, parent, name, now, Some(false)))
    }

    pub fn rmdir(&mut self, parent: InodeNo, name: &[u8], now: u64) -> Result<()> {
        self.transact(|txn, sb, dcache| unlink_logic(txn, sb, dcache, parent, name, now, Some(true)))
    }

    pub fn link(&mut self, ino: InodeNo, new_parent: InodeNo, new_name: &[u8], now: u64) -> Result<NodeAttr> {
        self.transact(|txn, sb, dcache| link_logic(txn, sb, dcache, ino, new_parent, new_name, now))
    }

    pub fn rename(
        &mut self,
        old_parent: InodeNo,
        old_name: &[u8],
        new_parent: InodeNo,
        new_name: &[u8],
        now: u64,
    ) -> Result<()> {
        log::debug!(
            "rename({:?}/{:?} -> {:?}/{:?})",
            old_parent,
            String::from_utf8_lossy(old_name),
            new_parent,
            String::from_utf8_lossy(new_name)
        );
        self.transact(|txn, sb, dcache| {
            rename_logic(txn, sb, dcache, old_parent, old_name, new_parent, new_name, now)
        })
    }

    pub fn opendir(&mut self, ino: InodeNo) -> Result<NodeAttr> {
        let attr = self.getattr(ino)?;
        if attr.stat.file_type() != Some(FileType::Directory) {
            return Err(Error::NotDir);
        }
        Ok(attr)
    }

    pub fn readdir(&mut self, ino: InodeNo) -> Result<Vec<DirEntry>> {
        self.transact(|txn, sb, dcache| readdir_logic(txn, sb, dcache, ino))
    }

    pub fn fsyncdir(&mut self, ino: InodeNo) -> Result<()> {
        self.opendir(ino).map(|_| ())
    }

    pub fn open(&mut self, ino: InodeNo) -> Result<NodeAttr> {
        let attr = self.getattr(ino)?;
        if attr.stat.file_type() == Some(FileType::Directory) {
            return Err(Error::IsDir);
        }
        Ok(attr)
    }

    pub fn read(&mut self, ino: InodeNo, offset: u64, len: u64, now: u64) -> Result<Vec<u8>> {
        self.transact(|txn, sb, _dcache| read_logic(txn, sb, ino, offset, len, now))
    }

    pub fn write(&mut self, ino: InodeNo, offset: u64, data: &[u8], now: u64) -> Result<u64> {
        log::debug!("write(ino={:?}, offset={offset}, len={})", ino, data.len());
        self.transact(|txn, sb, _dcache| write_logic(txn, sb, ino, offset, data, now))
    }

    /// No-op beyond confirming `ino` exists: every commit already durably publishes before
    /// its handler returns, so there is nothing left to flush (spec.md §4.8 expansion).
    pub fn fsync(&mut self, ino: InodeNo) -> Result<()> {
        self.getattr(ino).map(|_| ())
    }
}

// --- Logic functions, one per operation, run inside an already-open `Txn`. ---

fn lookup_logic(
    txn: &mut Txn,
    sb: &Superblock,
    dcache: &mut DirCache,
    parent: InodeNo,
    name: &[u8],
) -> Result<NodeAttr> {
    if name == b"." {
        let rec = inode::read_inode(txn, sb, parent)?;
        return Ok(NodeAttr {
            ino: parent,
            generation: rec.generation,
            stat: rec.stat(),
        });
    }
    if name == b".." {
        let target = if parent == InodeNo::ROOT {
            InodeNo::ROOT
        } else {
            dcache.parent_of(parent).ok_or(Error::InvalidArgument)?
        };
        let rec = inode::read_inode(txn, sb, target)?;
        return Ok(NodeAttr {
            ino: target,
            generation: rec.generation,
            stat: rec.stat(),
        });
    }
    let parent_rec = inode::read_inode(txn, sb, parent)?;
    if parent_rec.file_type() != Some(FileType::Directory) {
        return Err(Error::NotDir);
    }
    dcache.ensure_materialized(txn, parent, &parent_rec.root, &[])?;
    let md = dcache.get_dirent(parent, name).ok_or(Error::NotFound)?;
    let child = inode::read_inode(txn, sb, md.ino)?;
    dcache.remember_parent(md.ino, parent);
    Ok(NodeAttr {
        ino: md.ino,
        generation: child.generation,
        stat: child.stat(),
    })
}

fn setattr_logic(txn: &mut Txn, sb: &mut Superblock, ino: InodeNo, attr: &SetAttr, now: u64) -> Result<NodeAttr> {
    let mut rec = inode::read_inode(txn, sb, ino)?;
    if let Some(size) = attr.size {
        let old_size = rec.root.nbytes;
        if size < old_size {
            shrink_tree(txn, &mut rec.root, size)?;
        } else if size > old_size {
            tree::truncate_block_zero(txn, &mut rec.root, old_size, size, old_size)?;
            rec.root.nbytes = size;
        }
    }
    if let Some(mode) = attr.mode {
        rec.mode = (rec.mode & !0o7777) | (mode & 0o7777);
    }
    if let Some(uid) = attr.uid {
        rec.uid = uid;
    }
    if let Some(gid) = attr.gid {
        rec.gid = gid;
    }
    if let Some(atime) = attr.atime {
        rec.atime = atime;
    }
    if let Some(mtime) = attr.mtime {
        rec.mtime = mtime;
    }
    rec.ctime = now;
    inode::write_inode(txn, sb, ino, &rec)?;
    Ok(NodeAttr {
        ino,
        generation: rec.generation,
        stat: rec.stat(),
    })
}

/// Frees the blocks beyond `new_size` and collapses the tree's height to match, the
/// shrinking half of `setattr`'s size change (spec.md §4.3's extending half is
/// `truncate_block_zero`, already crawler-driven).
fn shrink_tree(txn: &mut Txn, root: &mut TreeRoot, new_size: u64) -> Result<()> {
    if new_size >= root.nbytes {
        return Ok(());
    }
    let span = tree::max_nblocks(root.height()) * BLOCK_SIZE as u64;
    root.ha = tree::free_beyond(txn, root.ha, span, new_size)?;
    root.nbytes = new_size;
    let needed_height = tree::height_for(new_size.div_ceil(BLOCK_SIZE as u64));
    if root.height() > needed_height {
        *root = tree::change_height(txn, *root, needed_height)?;
    }
    Ok(())
}

fn readlink_logic(txn: &mut Txn, sb: &Superblock, ino: InodeNo) -> Result<Vec<u8>> {
    let rec = inode::read_inode(txn, sb, ino)?;
    if rec.file_type() != Some(FileType::Link) {
        return Err(Error::InvalidArgument);
    }
    read_tree(txn, &rec.root)
}

fn read_tree(txn: &mut Txn, root: &TreeRoot) -> Result<Vec<u8>> {
    let len = root.nbytes;
    let mut buf = vec![0u8; len as usize];
    if len > 0 {
        crawler::crawl_tree_ro(txn, root, 0, len, &mut |bo, block, o, s, _valid, _policy| {
            let rel = (bo + o as u64) as usize;
            buf[rel..rel + s].copy_from_slice(&block[o..o + s]);
            Ok(CrawlOutcome::Continue)
        })?;
    }
    Ok(buf)
}

fn read_logic(txn: &mut Txn, sb: &mut Superblock, ino: InodeNo, offset: u64, len: u64, now: u64) -> Result<Vec<u8>> {
    let mut rec = inode::read_inode(txn, sb, ino)?;
    let avail = rec.root.nbytes.saturating_sub(offset);
    let n = len.min(avail);
    let mut buf = vec![0u8; n as usize];
    if n > 0 {
        crawler::crawl_tree_ro(txn, &rec.root, offset, n, &mut |bo, block, o, s, _valid, _policy| {
            let rel = (bo + o as u64 - offset) as usize;
            buf[rel..rel + s].copy_from_slice(&block[o..o + s]);
            Ok(CrawlOutcome::Continue)
        })?;
    }
    rec.atime = now;
    inode::write_inode(txn, sb, ino, &rec)?;
    Ok(buf)
}

fn write_logic(txn: &mut Txn, sb: &mut Superblock, ino: InodeNo, offset: u64, data: &[u8], now: u64) -> Result<u64> {
    let mut rec = inode::read_inode(txn, sb, ino)?;
    if data.is_empty() {
        return Ok(0);
    }
    crawler::crawl_tree(
        txn,
        &mut rec.root,
        offset,
        data.len() as u64,
        crate::commit_policy::CommitPolicy::Atomic,
        &mut |bo, block, o, s, _valid, _policy| {
            let rel = (bo + o as u64 - offset) as usize;
            block[o..o + s].copy_from_slice(&data[rel..rel + s]);
            Ok(CrawlOutcome::Continue)
        },
    )?;
    rec.mtime = now;
    rec.ctime = now;
    inode::write_inode(txn, sb, ino, &rec)?;
    Ok(data.len() as u64)
}

/// Allocates a fresh inode number, growing the inode table first if the allocator is
/// exhausted (spec.md §4.2 grow-and-retry). The returned generation is one past whatever
/// generation last occupied the slot, so a stale handle from a previous occupant never
/// aliases the new one.
fn alloc_inode_no(txn: &mut Txn, sb: &mut Superblock) -> Result<(InodeNo, u64)> {
    let idx = match txn.inodes.try_alloc() {
        Some(idx) => idx,
        None => {
            inode::grow_table(txn, sb)?;
            txn.inodes.try_alloc().ok_or(Error::OutOfSpace)?
        }
    };
    let ino = InodeNo(idx);
    let prev = inode::read_inode(txn, sb, ino)?;
    Ok((ino, prev.generation.wrapping_add(1)))
}

#[allow(clippy::too_many_arguments)]
fn create_child_logic(
    txn: &mut Txn,
    sb: &mut Superblock,
    dcache: &mut DirCache,
    parent: InodeNo,
    name: &[u8],
    mode: u16,
    uid: u32,
    gid: u32,
    now: u64,
    symlink_target: Option<&[u8]>,
) -> Result<NodeAttr> {
    if name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong);
    }
    let ft = FileType::from_mode(mode).ok_or(Error::InvalidArgument)?;
    let mut parent_rec = inode::read_inode(txn, sb, parent)?;
    if parent_rec.file_type() != Some(FileType::Directory) {
        return Err(Error::NotDir);
    }
    dcache.ensure_materialized(txn, parent, &parent_rec.root, &[])?;
    if dcache.get_dirent(parent, name).is_some() {
        return Err(Error::Exists);
    }

    let (ino, generation) = alloc_inode_no(txn, sb)?;
    let mut child = Inode::new(mode, uid, gid, now, generation);
    if ft == FileType::Directory {
        child.nlinks = 2;
    }
    if let Some(target) = symlink_target {
        crawler::crawl_tree(
            txn,
            &mut child.root,
            0,
            target.len() as u64,
            crate::commit_policy::CommitPolicy::Copy,
            &mut |bo, block, o, s, _valid, _policy| {
                let rel = (bo + o as u64) as usize;
                block[o..o + s].copy_from_slice(&target[rel..rel + s]);
                Ok(CrawlOutcome::Continue)
            },
        )?;
    }

    let offset = dirent::add(txn, &mut parent_rec.root, ino, ft, name)?;
    parent_rec.mtime = now;
    parent_rec.ctime = now;
    if ft == FileType::Directory {
        parent_rec.nlinks = parent_rec.nlinks.checked_add(1).ok_or(Error::TooManyLinks)?;
    }

    inode::write_inodes(txn, sb, &[(parent, parent_rec), (ino, child)])?;

    dcache.add_dirent(parent, name, MDirent { offset, ino, file_type: ft });
    dcache.remember_parent(ino, parent);

    Ok(NodeAttr {
        ino,
        generation,
        stat: child.stat(),
    })
}

/// Shared backend for `unlink`/`rmdir`: `expect_dir` is `Some(true)` for rmdir (target must
/// be an empty directory), `Some(false)` for unlink (target must not be a directory).
fn unlink_logic(
    txn: &mut Txn,
    sb: &mut Superblock,
    dcache: &mut DirCache,
    parent: InodeNo,
    name: &[u8],
    now: u64,
    expect_dir: Option<bool>,
) -> Result<()> {
    let mut parent_rec = inode::read_inode(txn, sb, parent)?;
    if parent_rec.file_type() != Some(FileType::Directory) {
        return Err(Error::NotDir);
    }
    dcache.ensure_materialized(txn, parent, &parent_rec.root, &[])?;
    let target = dcache.get_dirent(parent, name).ok_or(Error::NotFound)?;
    let mut child = inode::read_inode(txn, sb, target.ino)?;
    let is_dir = child.file_type() == Some(FileType::Directory);
    match expect_dir {
        Some(true) if !is_dir => return Err(Error::NotDir),
        Some(false) if is_dir => return Err(Error::IsDir),
        _ => {}
    }
    if is_dir && !dirent::is_empty(txn, &child.root)? {
        return Err(Error::NotEmpty);
    }

    dirent::remove(txn, &mut parent_rec.root, name)?;
    parent_rec.mtime = now;
    parent_rec.ctime = now;
    if is_dir {
        parent_rec.nlinks = parent_rec.nlinks.saturating_sub(1);
    }

    child.nlinks = child.nlinks.saturating_sub(1);
    child.ctime = now;
    if child.nlinks == 0 {
        tree::free_all(txn, &child.root)?;
        child.root = TreeRoot::EMPTY;
        txn.inodes.free(target.ino.get());
    }

    inode::write_inodes(txn, sb, &[(parent, parent_rec), (target.ino, child)])?;

    dcache.rem_dirent(parent, name);
    dcache.invalidate_dir(target.ino);
    Ok(())
}

fn link_logic(
    txn: &mut Txn,
    sb: &mut Superblock,
    dcache: &mut DirCache,
    ino: InodeNo,
    new_parent: InodeNo,
    new_name: &[u8],
    now: u64,
) -> Result<NodeAttr> {
    if new_name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong);
    }
    let mut child = inode::read_inode(txn, sb, ino)?;
    let ft = child.file_type().ok_or(Error::InvalidArgument)?;
    if ft == FileType::Directory {
        // Non-goal: no hard-link-to-directory (spec.md non-goals).
        return Err(Error::InvalidArgument);
    }
    let mut parent_rec = inode::read_inode(txn, sb, new_parent)?;
    if parent_rec.file_type() != Some(FileType::Directory) {
        return Err(Error::NotDir);
    }
    dcache.ensure_materialized(txn, new_parent, &parent_rec.root, &[])?;
    if dcache.get_dirent(new_parent, new_name).is_some() {
        return Err(Error::Exists);
    }

    child.nlinks = child.nlinks.checked_add(1).ok_or(Error::TooManyLinks)?;
    child.ctime = now;
    let offset = dirent::add(txn, &mut parent_rec.root, ino, ft, new_name)?;
    parent_rec.mtime = now;
    parent_rec.ctime = now;

    inode::write_inodes(txn, sb, &[(new_parent, parent_rec), (ino, child)])?;

    dcache.add_dirent(new_parent, new_name, MDirent { offset, ino, file_type: ft });

    Ok(NodeAttr {
        ino,
        generation: child.generation,
        stat: child.stat(),
    })
}

/// Implements `rename`'s cross-directory atomicity (spec.md §8 property 6) by folding every
/// touched inode record — both parents, the moved child, and an overwritten destination, if
/// any — through `inode::write_inodes`, which walks the inode table in a single recursive
/// descent (`crate::crawler::crawl_multi_write`) that reaches every touched record through
/// one shared CoW path and publishes the new root once, regardless of how many of the records
/// happen to share an ancestor indirect block.
#[allow(clippy::too_many_arguments)]
fn rename_logic(
    txn: &mut Txn,
    sb: &mut Superblock,
    dcache: &mut DirCache,
    old_parent: InodeNo,
    old_name: &[u8],
    new_parent: InodeNo,
    new_name: &[u8],
    now: u64,
) -> Result<()> {
    if old_name.len() > MAX_NAME_LEN || new_name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong);
    }

    let mut old_parent_rec = inode::read_inode(txn, sb, old_parent)?;
    if old_parent_rec.file_type() != Some(FileType::Directory) {
        return Err(Error::NotDir);
    }
    dcache.ensure_materialized(txn, old_parent, &old_parent_rec.root, &[old_parent, new_parent])?;
    let src = dcache.get_dirent(old_parent, old_name).ok_or(Error::NotFound)?;

    let same_parent = old_parent == new_parent;
    let mut new_parent_rec = if same_parent {
        old_parent_rec
    } else {
        let rec = inode::read_inode(txn, sb, new_parent)?;
        if rec.file_type() != Some(FileType::Directory) {
            return Err(Error::NotDir);
        }
        dcache.ensure_materialized(txn, new_parent, &rec.root, &[old_parent, new_parent])?;
        rec
    };

    if same_parent && old_name == new_name {
        return Ok(());
    }

    let existing_dst = dcache.get_dirent(new_parent, new_name);
    if let Some(dst) = existing_dst {
        if dst.ino == src.ino {
            // Two names already naming the same inode: nothing to move.
            return Ok(());
        }
    }

    let mut child = inode::read_inode(txn, sb, src.ino)?;
    let moving_dir = child.file_type() == Some(FileType::Directory);

    let mut overwritten: Option<(InodeNo, Inode)> = None;
    let new_offset: u64;
    if let Some(dst) = existing_dst {
        if dst.file_type == FileType::Directory {
            let dst_child = inode::read_inode(txn, sb, dst.ino)?;
            if !dirent::is_empty(txn, &dst_child.root)? {
                return Err(Error::NotEmpty);
            }
        }
        if moving_dir != (dst.file_type == FileType::Directory) {
            return Err(Error::InvalidArgument);
        }
        dirent::retarget(txn, &mut new_parent_rec.root, new_name, src.ino)?;
        let mut old_target = inode::read_inode(txn, sb, dst.ino)?;
        old_target.nlinks = old_target.nlinks.saturating_sub(1);
        if old_target.nlinks == 0 {
            tree::free_all(txn, &old_target.root)?;
            old_target.root = TreeRoot::EMPTY;
            txn.inodes.free(dst.ino.get());
        }
        old_target.ctime = now;
        overwritten = Some((dst.ino, old_target));
        new_offset = dst.offset;
    } else {
        new_offset = dirent::add(txn, &mut new_parent_rec.root, src.ino, src.file_type, new_name)?;
    }

    // Remove the source name. If both names live in the same directory this must apply to
    // the root value the destination edit above just produced, not a stale second copy of
    // the same tree.
    if same_parent {
        dirent::remove(txn, &mut new_parent_rec.root, old_name)?;
    } else {
        dirent::remove(txn, &mut old_parent_rec.root, old_name)?;
    }

    new_parent_rec.mtime = now;
    new_parent_rec.ctime = now;
    child.ctime = now;

    let mut writes: Vec<(InodeNo, Inode)> = Vec::with_capacity(4);
    if same_parent {
        writes.push((old_parent, new_parent_rec));
    } else {
        old_parent_rec.mtime = now;
        old_parent_rec.ctime = now;
        if moving_dir {
            old_parent_rec.nlinks = old_parent_rec.nlinks.saturating_sub(1);
            new_parent_rec.nlinks = new_parent_rec
                .nlinks
                .checked_add(1)
                .ok_or(Error::TooManyLinks)?;
        }
        writes.push((old_parent, old_parent_rec));
        writes.push((new_parent, new_parent_rec));
    }
    writes.push((src.ino, child));
    if let Some(ow) = overwritten {
        writes.push(ow);
    }

    inode::write_inodes(txn, sb, &writes)?;

    dcache.rem_dirent(old_parent, old_name);
    if let Some(dst) = existing_dst {
        dcache.invalidate_dir(dst.ino);
    }
    dcache.add_dirent(
        new_parent,
        new_name,
        MDirent {
            offset: new_offset,
            ino: src.ino,
            file_type: src.file_type,
        },
    );
    if !same_parent {
        dcache.reparent(src.ino, new_parent);
    }
    Ok(())
}

fn readdir_logic(txn: &mut Txn, sb: &Superblock, dcache: &DirCache, ino: InodeNo) -> Result<Vec<DirEntry>> {
    let rec = inode::read_inode(txn, sb, ino)?;
    if rec.file_type() != Some(FileType::Directory) {
        return Err(Error::NotDir);
    }
    let parent = if ino == InodeNo::ROOT {
        InodeNo::ROOT
    } else {
        dcache.parent_of(ino).ok_or(Error::InvalidArgument)?
    };
    let mut out = vec![
        DirEntry {
            name: b".".to_vec(),
            ino,
            file_type: FileType::Directory,
        },
        DirEntry {
            name: b"..".to_vec(),
            ino: parent,
            file_type: FileType::Directory,
        },
    ];
    for e in dirent::read_all(txn, &rec.root)? {
        if e.is_free() {
            continue;
        }
        let Some(ft) = e.file_type else { continue };
        out.push(DirEntry {
            name: e.name,
            ino: e.ino,
            file_type: ft,
        });
    }
    Ok(out)
}

/// Opens a file-backed BPRAM region for either `BpramFs::format_file` or `BpramFs::mount`,
/// creating it (zero-filled to `nblocks * BLOCK_SIZE`) if it does not already exist.
pub fn create_backing_file(path: &std::path::Path, nblocks: u64) -> io::Result<File> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.set_len(nblocks * BLOCK_SIZE as u64)?;
    Ok(file)
}
