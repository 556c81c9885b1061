//! The commit policy contract a crawler callback observes (spec.md §4.4.1), and the
//! filesystem-wide commit mode that governs how a transaction finally publishes its writes
//! (spec.md §4.6).

/// Size in bytes of the single aligned word an ATOMIC write may target.
pub const ATOMIC_SIZE: u64 = 8;

/// The three operating modes named in spec.md §1/§4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Double-super shadow paging.
    Sp,
    /// Short-circuit shadow paging: indirect in-DRAM staging, one atomic bit-level commit.
    Scsp,
    /// In-place with per-operation atomic discipline.
    Bpfs,
}

impl CommitMode {
    pub fn to_u8(self) -> u8 {
        match self {
            CommitMode::Sp => 0,
            CommitMode::Scsp => 1,
            CommitMode::Bpfs => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CommitMode::Sp),
            1 => Some(CommitMode::Scsp),
            2 => Some(CommitMode::Bpfs),
            _ => None,
        }
    }
}

/// The contract a crawler callback observes when deciding whether it may mutate a block in
/// place (spec.md §4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Read-only; no writes permitted anywhere on the path.
    None,
    /// Writes permitted only into freshly copied blocks (full shadow).
    Copy,
    /// In-place allowed when the whole write fits inside a single 8-byte aligned word, or
    /// targets beyond-valid bytes; else behaves as `Copy`. Collapses to `Copy` when the
    /// filesystem runs in [`CommitMode::Sp`].
    Atomic,
    /// No constraints; the block is known not to be referenced by the committed tree yet.
    Free,
}

impl CommitPolicy {
    /// Applies the SP-mode collapse named in spec.md §4.4.1: "Collapses to COPY when
    /// compiled in SP mode."
    pub fn for_mode(self, mode: CommitMode) -> CommitPolicy {
        match (self, mode) {
            (CommitPolicy::Atomic, CommitMode::Sp) => CommitPolicy::Copy,
            (p, _) => p,
        }
    }

    /// Whether a write of `size` bytes at `off` fits within a single 8-byte aligned word.
    pub fn write_is_atomic(off: u64, size: u64) -> bool {
        if size == 0 {
            return true;
        }
        let word_start = off - (off % ATOMIC_SIZE);
        off + size <= word_start + ATOMIC_SIZE
    }

    /// Degrades `ATOMIC` to `COPY` unless the write range is a single child slot or lies
    /// entirely beyond `valid` (spec.md §4.4.2 descent rule 2).
    pub fn descend(
        self,
        firstno: u64,
        lastno: u64,
        beyond_valid: bool,
    ) -> CommitPolicy {
        match self {
            CommitPolicy::Atomic if firstno == lastno || beyond_valid => CommitPolicy::Atomic,
            CommitPolicy::Atomic => CommitPolicy::Copy,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sp_mode_collapses_atomic() {
        assert_eq!(
            CommitPolicy::Atomic.for_mode(CommitMode::Sp),
            CommitPolicy::Copy
        );
        assert_eq!(
            CommitPolicy::Atomic.for_mode(CommitMode::Scsp),
            CommitPolicy::Atomic
        );
    }

    #[test]
    fn atomic_word_check() {
        assert!(CommitPolicy::write_is_atomic(0, 8));
        assert!(CommitPolicy::write_is_atomic(8, 4));
        assert!(!CommitPolicy::write_is_atomic(4, 8));
        assert!(!CommitPolicy::write_is_atomic(0, 9));
    }
}
