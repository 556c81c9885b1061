//! In-place atomic-discipline mode (spec.md §1/§4.6 "BPFS").
//!
//! BPFS behaves identically to SCSP in this crate's cascading-CoW model: both let `ATOMIC`
//! stay `ATOMIC` (unlike SP) and both publish via the same single 8-byte word found by
//! `crate::commit::publish_super_root`. The distinction the original implementation draws —
//! BPFS additionally write-protects pages outside an active transaction in debug builds, to
//! catch code that forgets the crawler discipline and pokes at a block directly — has no
//! analogue in a hosted process without real persistent-memory page protection, so this
//! module only documents the distinction rather than implementing a debug guard.
