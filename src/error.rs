//! Error kinds returned by fallible operations.
//!
//! Every top-level handler is transactional: on any [`Error`] surfacing after staging has
//! begun, the caller must route through [`crate::txn::Txn::abort`] rather than leaving
//! partial state observable (spec.md §7).

use thiserror::Error;

/// The classified error kinds a BPRAM filesystem operation can fail with.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// `ino` or `name` does not exist.
    #[error("not found")]
    NotFound,
    /// Target name already present.
    #[error("already exists")]
    Exists,
    /// Parent is not a directory.
    #[error("not a directory")]
    NotDir,
    /// Target is a directory where a non-directory was expected.
    #[error("is a directory")]
    IsDir,
    /// `rmdir` on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,
    /// Name length exceeds [`crate::dirent::MAX_NAME_LEN`].
    #[error("name too long")]
    NameTooLong,
    /// Link count would overflow `u32`.
    #[error("too many links")]
    TooManyLinks,
    /// Block or inode bitmap exhausted.
    #[error("out of space")]
    OutOfSpace,
    /// DRAM allocation failure for staging, dcache, or indirect-CoW tables.
    #[error("out of memory")]
    OutOfMemory,
    /// Ino outside bitmap range, or a malformed request.
    #[error("invalid argument")]
    InvalidArgument,
    /// `mknod` of a block/char device without an `rdev`, or another unsupported request shape.
    #[error("not supported")]
    NotSupported,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Marks a violated structural invariant. Per spec.md §7, programming-error classes
/// terminate the process rather than returning a recoverable [`Error`].
#[track_caller]
pub(crate) fn invariant(cond: bool, msg: &'static str) {
    assert!(cond, "bpramfs invariant violated: {msg}");
}
