//! Table contract and the single-shard table
//!
//! [`KmerTable`] is the operation set every table exposes. [`TableShard`]
//! implements it over one [`HashArray`] guarded by the shard's coarse lock:
//! per-key operations share the read side, while resize, regenerate,
//! ownership setup/teardown and overflow rebalancing take the write side.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error};

use crate::constants::NOT_PRESENT;
use crate::error::TableError;
use crate::hash_array::HashArray;
use crate::value::ValueShape;

/// Operations common to single shards and shard sets
///
/// Absent keys read as `None`, `false` or [`NOT_PRESENT`]. All per-key
/// operations are safe to call concurrently from any thread.
pub trait KmerTable: Send + Sync {
    /// Add one to the count of `key` (inserting at 1); returns the new count
    fn increment(&self, key: u64) -> i32;

    /// Add `amount` to the count of `key`, saturating; returns the new count
    fn increment_by(&self, key: u64, amount: u32) -> i32;

    /// Increment `key`; returns whether it was newly created
    fn increment_and_report_created(&self, key: u64) -> bool;

    /// Overwrite-or-insert a single value; returns whether `key` was new
    fn set_value(&self, key: u64, value: i32) -> bool;

    /// Overwrite-or-insert a value set; returns whether `key` was new
    fn set_values(&self, key: u64, values: &[i32]) -> bool;

    /// Insert `key` with `value` only if absent; returns whether it was inserted
    fn set_if_absent(&self, key: u64, value: i32) -> bool;

    /// Primary value of `key`
    fn get_value(&self, key: u64) -> Option<i32>;

    /// Replace the contents of `out` with the values of `key`; returns
    /// whether the key was present
    fn get_values_into(&self, key: u64, out: &mut Vec<i32>) -> bool;

    /// Values of `key`, read into `scratch`
    ///
    /// An absent key yields `[NOT_PRESENT]`.
    fn get_values<'a>(&self, key: u64, scratch: &'a mut Vec<i32>) -> &'a [i32] {
        if !self.get_values_into(key, scratch) {
            scratch.clear();
            scratch.push(NOT_PRESENT);
        }
        scratch
    }

    /// Whether `key` is present
    fn contains(&self, key: u64) -> bool;

    /// Total live keys (primary plus overflow)
    fn size(&self) -> usize;

    /// Primary array length
    fn capacity(&self) -> usize;

    /// Claim `key` for `worker`; returns the owner once the race resolves
    fn claim(&self, key: u64, worker: i32) -> i32;

    /// Release `key` if `worker` still owns it
    fn release(&self, key: u64, worker: i32) -> bool;

    /// Current owner of `key`, or [`NO_OWNER`](crate::constants::NO_OWNER)
    fn owner_of(&self, key: u64) -> i32;

    /// Allocate (or reset) owner tags
    fn initialize_ownership(&self) -> Result<(), TableError>;

    /// Drop owner tags; required before any resize
    fn clear_ownership(&self);

    /// Grow if the live-key count warrants it; returns whether anything grew
    fn resize(&self) -> Result<bool, TableError>;

    /// Remove keys with depth `<= min_count`; returns how many were removed
    fn regenerate(&self, min_count: i32) -> Result<usize, TableError>;

    /// Depth histogram over `0..=max`
    fn fill_histogram(&self, max: usize) -> Vec<u64>;

    /// GC bases summed per depth bucket over `0..=max`
    fn count_gc(&self, max: usize) -> Vec<u64>;
}

/// One independent table: a [`HashArray`] behind the shard's coarse lock
pub struct TableShard<V: ValueShape> {
    array: RwLock<HashArray<V>>,
    auto_resize: bool,
}

impl<V: ValueShape> TableShard<V> {
    /// Allocate a shard whose capacity is the smallest prime `>= initial_size`
    ///
    /// # Errors
    /// Returns [`TableError::Allocation`] if the arrays cannot be allocated.
    pub fn new(initial_size: usize, auto_resize: bool, growable: bool) -> Result<Self, TableError> {
        Ok(Self::from_array(HashArray::new(initial_size, growable)?, auto_resize))
    }

    /// Wrap an existing array
    pub fn from_array(array: HashArray<V>, auto_resize: bool) -> Self {
        Self { array: RwLock::new(array), auto_resize }
    }

    /// Shared access to the underlying array
    pub fn read(&self) -> RwLockReadGuard<'_, HashArray<V>> {
        self.array.read()
    }

    /// Exclusive access to the underlying array
    pub fn write(&self) -> RwLockWriteGuard<'_, HashArray<V>> {
        self.array.write()
    }

    /// Unwrap the array
    pub fn into_inner(self) -> HashArray<V> {
        self.array.into_inner()
    }

    /// Whether insertions may trigger a resize
    pub fn auto_resize(&self) -> bool {
        self.auto_resize
    }

    /// Number of keys held in the overflow forest
    pub fn victim_size(&self) -> usize {
        self.array.read().victim_size()
    }

    /// Rebuild every overflow tree balanced
    pub fn rebalance_victims(&self) {
        self.array.write().rebalance_victims();
    }

    /// Drop every key, keeping the capacity
    pub fn clear(&self) {
        self.array.write().clear();
    }

    /// Run an inserting operation, then grow if it pushed the shard past its limit
    ///
    /// Growth is skipped while ownership tags are allocated, so inserts past
    /// the limit never touch the write lock in that state.
    #[inline]
    fn insert<R>(&self, op: impl FnOnce(&HashArray<V>) -> R) -> R {
        let (result, over) = {
            let array = self.array.read();
            let result = op(&array);
            let over = self.auto_resize && !array.has_ownership() && array.over_limit();
            (result, over)
        };
        if over {
            self.grow();
        }
        result
    }

    #[cold]
    fn grow(&self) {
        let mut array = self.array.write();
        // Another writer may have grown it while we waited
        if !array.over_limit() {
            return;
        }
        if array.has_ownership() {
            debug!("Deferring resize of a shard with ownership tags allocated");
            return;
        }
        if let Err(e) = array.resize() {
            error!("Automatic resize failed: {}", e);
            std::process::abort();
        }
    }
}

impl<V: ValueShape> KmerTable for TableShard<V> {
    fn increment(&self, key: u64) -> i32 {
        self.insert(|a| a.increment(key))
    }

    fn increment_by(&self, key: u64, amount: u32) -> i32 {
        self.insert(|a| a.increment_by(key, amount))
    }

    fn increment_and_report_created(&self, key: u64) -> bool {
        self.insert(|a| a.increment_and_report_created(key))
    }

    fn set_value(&self, key: u64, value: i32) -> bool {
        self.insert(|a| a.set_value(key, value))
    }

    fn set_values(&self, key: u64, values: &[i32]) -> bool {
        self.insert(|a| a.set_values(key, values))
    }

    fn set_if_absent(&self, key: u64, value: i32) -> bool {
        self.insert(|a| a.set_if_absent(key, value))
    }

    fn get_value(&self, key: u64) -> Option<i32> {
        self.array.read().get_value(key)
    }

    fn get_values_into(&self, key: u64, out: &mut Vec<i32>) -> bool {
        self.array.read().get_values_into(key, out)
    }

    fn contains(&self, key: u64) -> bool {
        self.array.read().contains(key)
    }

    fn size(&self) -> usize {
        self.array.read().len()
    }

    fn capacity(&self) -> usize {
        self.array.read().capacity()
    }

    fn claim(&self, key: u64, worker: i32) -> i32 {
        self.array.read().claim(key, worker)
    }

    fn release(&self, key: u64, worker: i32) -> bool {
        self.array.read().release(key, worker)
    }

    fn owner_of(&self, key: u64) -> i32 {
        self.array.read().owner_of(key)
    }

    fn initialize_ownership(&self) -> Result<(), TableError> {
        self.array.write().initialize_ownership()
    }

    fn clear_ownership(&self) {
        self.array.write().clear_ownership();
    }

    fn resize(&self) -> Result<bool, TableError> {
        self.array.write().resize()
    }

    fn regenerate(&self, min_count: i32) -> Result<usize, TableError> {
        self.array.write().regenerate(min_count)
    }

    fn fill_histogram(&self, max: usize) -> Vec<u64> {
        self.array.read().fill_histogram(max)
    }

    fn count_gc(&self, max: usize) -> Vec<u64> {
        self.array.read().count_gc(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{NO_OWNER, PROBE_WINDOW};
    use crate::value::{Counter, ValueSet};

    #[test]
    fn test_auto_resize_on_insert() {
        let shard = TableShard::<Counter>::new(31, true, true).unwrap();
        for key in 0..1000u64 {
            shard.increment(key * 3);
        }
        assert_eq!(shard.size(), 1000);
        assert!(shard.capacity() > 1000);
        let array = shard.read();
        assert!(!array.over_limit());
        for key in 0..1000u64 {
            assert_eq!(array.get_value(key * 3), Some(1));
        }
    }

    #[test]
    fn test_fixed_shard_overflows_instead_of_growing() {
        let shard = TableShard::<Counter>::new(31, false, false).unwrap();
        for key in 0..500u64 {
            shard.increment(key);
        }
        assert_eq!(shard.capacity(), 31);
        assert_eq!(shard.size(), 500);
        let array = shard.read();
        assert!(array.primary_size() <= 31 + PROBE_WINDOW);
        assert_eq!(array.primary_size() + array.victim_size(), 500);
        assert!(array.victim_size() >= 500 - 31 - PROBE_WINDOW);
    }

    #[test]
    fn test_resize_deferred_while_owned() {
        let shard = TableShard::<Counter>::new(31, true, true).unwrap();
        shard.increment(1);
        shard.initialize_ownership().unwrap();
        for key in 0..200u64 {
            shard.increment(key);
        }
        assert_eq!(shard.capacity(), 31);
        shard.clear_ownership();
        shard.increment(7);
        assert!(shard.capacity() > 31);
        assert_eq!(shard.size(), 200);
    }

    #[test]
    fn test_owned_inserts_past_limit_stay_on_read_lock() {
        let shard = TableShard::<Counter>::new(31, true, true).unwrap();
        shard.initialize_ownership().unwrap();
        {
            // A held read guard would deadlock any attempt to take the write side
            let guard = shard.read();
            for key in 0..200u64 {
                shard.increment(key);
            }
            assert_eq!(guard.capacity(), 31);
            assert!(guard.over_limit());
        }
        shard.clear_ownership();
        shard.increment(500);
        assert!(shard.capacity() > 31);
    }

    #[test]
    fn test_increment_by_never_lowers_count() {
        let shard = TableShard::<Counter>::new(101, true, true).unwrap();
        assert_eq!(shard.increment_by(5, 10), 10);
        assert_eq!(shard.increment_by(5, 0), 10);
        assert_eq!(shard.get_value(5), Some(10));
        // Amounts beyond i32::MAX saturate rather than wrap negative
        assert_eq!(shard.increment_by(5, u32::MAX), i32::MAX);
        assert_eq!(shard.increment_by(5, 3), i32::MAX);
        assert_eq!(shard.get_value(5), Some(i32::MAX));
    }

    #[test]
    fn test_get_values_sentinel() {
        let shard = TableShard::<ValueSet>::new(101, false, false).unwrap();
        shard.set_values(5, &[2, 4]);
        let mut scratch = Vec::new();
        assert_eq!(shard.get_values(5, &mut scratch), &[2, 4]);
        assert_eq!(shard.get_values(6, &mut scratch), &[NOT_PRESENT]);
    }

    #[test]
    fn test_contract_through_trait_object() {
        let shard = TableShard::<Counter>::new(101, true, true).unwrap();
        let table: &dyn KmerTable = &shard;
        assert!(table.increment_and_report_created(3));
        assert_eq!(table.increment(3), 2);
        assert!(table.set_if_absent(4, 9));
        assert!(!table.set_if_absent(4, 1));
        assert_eq!(table.get_value(4), Some(9));

        table.initialize_ownership().unwrap();
        assert_eq!(table.claim(3, 2), 2);
        assert_eq!(table.owner_of(3), 2);
        assert!(table.release(3, 2));
        assert_eq!(table.owner_of(3), NO_OWNER);
        table.clear_ownership();

        assert_eq!(table.regenerate(1).unwrap(), 0);
        assert_eq!(table.size(), 2);
        assert_eq!(table.fill_histogram(10)[9], 1);
    }
}
