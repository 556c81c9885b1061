//! A crash-consistent, byte-addressable persistent-memory filesystem core.
//!
//! This crate implements the allocator, tree, crawler and commit-mode machinery of a
//! BPFS-style filesystem (spec.md §1-§4) and exposes it through [`fs::BpramFs`], a POSIX-shaped
//! operation surface (spec.md §6). It does not itself bridge to a kernel VFS, a userspace mount
//! daemon, or any particular wire protocol — those are explicitly out of scope (spec.md
//! Non-goals) and are left to a caller that embeds this crate.

pub mod alloc;
pub mod bitmap;
pub mod bpram;
pub mod commit;
pub mod commit_policy;
pub mod config;
pub mod cow;
pub mod crawler;
pub mod dcache;
pub mod dirent;
pub mod error;
pub mod format;
pub mod fs;
pub mod ha;
pub mod inode;
pub mod mount;
pub mod stat;
pub mod superblock;
pub mod tree;
pub mod txn;

pub use bpram::{BlockNo, Bpram, BLOCK_SIZE};
pub use commit_policy::CommitMode;
pub use config::Config;
pub use error::{Error, Result};
pub use fs::{create_backing_file, BpramFs, DirEntry, NodeAttr, SetAttr, StatFs};
pub use inode::InodeNo;
pub use stat::{FileType, Stat};
