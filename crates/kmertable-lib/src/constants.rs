//! Constants and tuning parameters for the k-mer tables
//!
//! This module defines the sentinels, probe geometry and load-factor
//! bounds shared by every table in the crate.

/// Key sentinel marking an unoccupied primary slot
pub const EMPTY_KEY: u64 = u64::MAX;

/// Value sentinel for "no value" (terminates value lists in dumps)
pub const NOT_PRESENT: i32 = -1;

/// Owner tag of a slot nobody has claimed
pub const NO_OWNER: i32 = -1;

/// Maximum number of consecutive primary cells probed before a key is
/// handed to the overflow forest
pub const PROBE_WINDOW: usize = 21;

/// Load factor above which a growable table resizes
pub const MAX_LOAD_FACTOR: f64 = 0.905;

/// Lowest load factor a resize is allowed to produce
pub const MIN_LOAD_FACTOR: f64 = 0.58;

/// Preferred growth factor for a resize
pub const RESIZE_MULTIPLIER: f64 = 2.0;

/// Keys are packed k-mers of at most this many bits
pub const MAX_KEY_BITS: u32 = 62;

/// Largest k-mer length representable in a single-word key
pub const MAX_K: usize = 31;

/// Smallest k-mer length accepted by the configuration
pub const MIN_K: usize = 1;

/// Largest prime not exceeding `i32::MAX - PROBE_WINDOW - 20`.
///
/// Single-shard capacity never grows past this value.
pub const MAX_CAPACITY: usize = 2_147_483_587;

/// Smallest primary array ever allocated
pub const MIN_CAPACITY: usize = 31;

/// Overflow forests get roughly one root per this many primary cells
pub const VICTIM_ROOT_DIVISOR: usize = 8;

/// Fewest roots an overflow forest is created with
pub const MIN_VICTIM_ROOTS: usize = 11;

/// Per-worker dump buffer is flushed to the sink past this many bytes
pub const DEFAULT_DUMP_BUFFER_BYTES: usize = 16 * 1024;

/// Version number
pub const VERSION: (u8, u8, u8) = (0, 1, 0);

/// Check that a key fits the packed k-mer domain `[0, 2^62)`
#[inline]
pub const fn is_valid_key(key: u64) -> bool {
    key < (1u64 << MAX_KEY_BITS)
}

/// Check if a k-mer length is supported
#[inline]
pub const fn is_valid_k(k: usize) -> bool {
    k >= MIN_K && k <= MAX_K
}
