//! Runtime configuration knobs (spec.md §6 "Environment knobs").
//!
//! The only knob the core spec names is a consistency-check interval for test builds; it is
//! read from the environment once at mount, the same "env var in, typed config out" shape the
//! rest of the hosted Rust ecosystem uses in place of the teacher's build-time `build_cfg!`
//! macro (`examples/maestro-os-maestro/kernel/src/config.rs`), which has no meaning outside a
//! kernel build graph.

use std::env;

/// Env var name: number of completed operations between forced bitmap-vs-live-tree
/// reconstructions. Unset or `0` disables the check.
pub const CONSISTENCY_CHECK_INTERVAL_VAR: &str = "BPRAMFS_CONSISTENCY_CHECK_INTERVAL";

/// Env var name: dcache capacity override, mainly for tests that want eviction pressure
/// without allocating 1024 directories.
pub const DCACHE_CAPACITY_VAR: &str = "BPRAMFS_DCACHE_CAPACITY";

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// `0` means disabled. When nonzero, every `consistency_check_interval`-th committed
    /// operation triggers `crate::mount::check_consistency`.
    pub consistency_check_interval: u64,
    pub dcache_capacity: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            consistency_check_interval: read_u64(CONSISTENCY_CHECK_INTERVAL_VAR).unwrap_or(0),
            dcache_capacity: read_u64(DCACHE_CAPACITY_VAR)
                .map(|v| v as usize)
                .unwrap_or(crate::dcache::NMDIRS_MAX),
        }
    }

    pub fn disabled() -> Self {
        Self {
            consistency_check_interval: 0,
            dcache_capacity: crate::dcache::NMDIRS_MAX,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::disabled()
    }
}

fn read_u64(var: &str) -> Option<u64> {
    env::var(var).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_has_zero_interval() {
        assert_eq!(Config::disabled().consistency_check_interval, 0);
    }
}
