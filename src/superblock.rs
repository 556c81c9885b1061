//! The persistent superblock descriptor (spec.md §3, on-disk layout fixed by §6).
//!
//! Magic and structure-version constants are taken from the original implementation
//! (`examples/original_source/bpfs_structs.h`: `BPFS_FS_MAGIC 0xB9F5`,
//! `BPFS_STRUCT_VERSION 7`), which spec.md §6 also names for the magic number.

use crate::bpram::{BlockNo, Bpram};
use crate::commit_policy::CommitMode;
use crate::ha::TreeRoot;

/// The filesystem's magic number. Writing it is the last step of formatting (spec.md §6).
pub const MAGIC: u32 = 0xB9F5;
/// On-disk structure version, carried so a future incompatible layout is rejectable at mount.
pub const FORMAT_VERSION: u32 = 7;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_UUID: usize = 8;
const OFF_NBLOCKS: usize = 24;
const OFF_INODE_ROOT: usize = 32;
const OFF_INODE_ROOT_2: usize = 48;
const OFF_COMMIT_MODE: usize = 64;
const OFF_EPHEMERAL_VALID: usize = 65;

/// In-memory mirror of the on-disk superblock.
///
/// `inode_root`/`inode_root_2` hold the primary and shadow roots of the inode tree (spec.md
/// §2); only the primary is authoritative in SCSP and BPFS mode. They are stored as full
/// 16-byte [`TreeRoot`] descriptors (not a bare block address) because the inode tree's
/// height must be known without a second indirection, and the `ha` half alone is exactly the
/// single atomic word SCSP/BPFS publish their commit through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub version: u32,
    pub uuid: [u8; 16],
    pub nblocks: u64,
    pub inode_root: TreeRoot,
    pub inode_root_2: TreeRoot,
    pub commit_mode: CommitMode,
    /// Whether on-medium link counts are trustworthy at mount (spec.md §2).
    pub ephemeral_valid: bool,
}

impl Superblock {
    pub fn new(nblocks: u64, commit_mode: CommitMode, uuid: [u8; 16]) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            uuid,
            nblocks,
            inode_root: TreeRoot::EMPTY,
            inode_root_2: TreeRoot::EMPTY,
            commit_mode,
            ephemeral_valid: true,
        }
    }

    pub fn to_bytes(&self) -> [u8; 4096] {
        let mut b = [0u8; 4096];
        b[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&self.magic.to_le_bytes());
        b[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&self.version.to_le_bytes());
        b[OFF_UUID..OFF_UUID + 16].copy_from_slice(&self.uuid);
        b[OFF_NBLOCKS..OFF_NBLOCKS + 8].copy_from_slice(&self.nblocks.to_le_bytes());
        b[OFF_INODE_ROOT..OFF_INODE_ROOT + 16].copy_from_slice(&self.inode_root.to_bytes());
        b[OFF_INODE_ROOT_2..OFF_INODE_ROOT_2 + 16].copy_from_slice(&self.inode_root_2.to_bytes());
        b[OFF_COMMIT_MODE] = self.commit_mode.to_u8();
        b[OFF_EPHEMERAL_VALID] = self.ephemeral_valid as u8;
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        let magic = u32::from_le_bytes(b[OFF_MAGIC..OFF_MAGIC + 4].try_into().ok()?);
        let version = u32::from_le_bytes(b[OFF_VERSION..OFF_VERSION + 4].try_into().ok()?);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&b[OFF_UUID..OFF_UUID + 16]);
        let nblocks = u64::from_le_bytes(b[OFF_NBLOCKS..OFF_NBLOCKS + 8].try_into().ok()?);
        let inode_root = TreeRoot::from_bytes(&b[OFF_INODE_ROOT..OFF_INODE_ROOT + 16]);
        let inode_root_2 = TreeRoot::from_bytes(&b[OFF_INODE_ROOT_2..OFF_INODE_ROOT_2 + 16]);
        let commit_mode = CommitMode::from_u8(b[OFF_COMMIT_MODE])?;
        let ephemeral_valid = b[OFF_EPHEMERAL_VALID] != 0;
        Some(Self {
            magic,
            version,
            uuid,
            nblocks,
            inode_root,
            inode_root_2,
            commit_mode,
            ephemeral_valid,
        })
    }

    pub fn is_valid_magic(&self) -> bool {
        self.magic == MAGIC
    }

    /// Writes this superblock to both on-medium copies (blocks 1 and 2), matching SP mode's
    /// redundant layout. Non-SP modes only treat block 1 as authoritative but formatting
    /// always mirrors both so a later re-format to SP mode finds a consistent shadow.
    pub fn write_both(&self, bpram: &mut Bpram) {
        let bytes = self.to_bytes();
        bpram.block_mut(BlockNo::SUPER).copy_from_slice(&bytes);
        bpram.block_mut(BlockNo::SUPER_2).copy_from_slice(&bytes);
    }

    /// Writes only the primary copy (block 1).
    pub fn write_primary(&self, bpram: &mut Bpram) {
        let bytes = self.to_bytes();
        bpram.block_mut(BlockNo::SUPER).copy_from_slice(&bytes);
    }

    /// Writes only the shadow copy (block 2).
    pub fn write_shadow(&self, bpram: &mut Bpram) {
        let bytes = self.to_bytes();
        bpram.block_mut(BlockNo::SUPER_2).copy_from_slice(&bytes);
    }

    pub fn read_primary(bpram: &Bpram) -> Option<Self> {
        Self::from_bytes(bpram.block(BlockNo::SUPER))
    }

    pub fn read_shadow(bpram: &Bpram) -> Option<Self> {
        Self::from_bytes(bpram.block(BlockNo::SUPER_2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let sp = Superblock::new(1024, CommitMode::Scsp, [7u8; 16]);
        let bytes = sp.to_bytes();
        let back = Superblock::from_bytes(&bytes).unwrap();
        assert_eq!(sp, back);
    }
}
