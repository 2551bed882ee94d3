//! Growth and rehash of a [`HashArray`]
//!
//! A growable table resizes once `primary_size + victim_size` exceeds its
//! size limit. The new capacity aims for [`RESIZE_MULTIPLIER`] times the
//! current one, kept inside the load-factor band
//! `[MIN_LOAD_FACTOR, MAX_LOAD_FACTOR]` for the current key count and rounded
//! up to a prime. A table never shrinks; at [`MAX_CAPACITY`] it stops
//! tracking a limit altogether.
//!
//! Every live entry, from the primary array and the overflow forest, is
//! moved into freshly allocated structures. Owner tags must be cleared
//! first.

use std::sync::atomic::AtomicU64;

use tracing::{debug, info};

use crate::constants::{
    EMPTY_KEY, MAX_CAPACITY, MAX_LOAD_FACTOR, MIN_LOAD_FACTOR, PROBE_WINDOW, RESIZE_MULTIPLIER,
};
use crate::error::{try_alloc_slice, TableError};
use crate::hash_array::{size_limit_for, HashArray};
use crate::primes::prime_at_least;
use crate::value::ValueShape;
use crate::victim::VictimForest;

/// Capacity a table of `capacity` cells holding `live` keys should grow to
///
/// The result may be `<= capacity`, meaning no growth is warranted.
pub fn target_capacity(capacity: usize, live: usize) -> usize {
    let live = live as f64;
    let lowest = live / MAX_LOAD_FACTOR;
    let highest = live / MIN_LOAD_FACTOR;
    let wanted = (10.0 + capacity as f64 * RESIZE_MULTIPLIER)
        .max(lowest)
        .min(highest);
    (prime_at_least(wanted as u64) as usize).min(MAX_CAPACITY)
}

impl<V: ValueShape> HashArray<V> {
    /// Grow the table if its key count warrants it
    ///
    /// Returns `true` if the arrays were reallocated.
    ///
    /// # Errors
    /// Returns [`TableError::Allocation`] if the new arrays cannot be
    /// allocated; the table is left untouched in that case.
    ///
    /// # Panics
    /// Panics if owner tags are allocated.
    pub fn resize(&mut self) -> Result<bool, TableError> {
        assert!(
            self.owners.is_none(),
            "resize requires ownership to be cleared first"
        );
        if !self.growable || self.capacity >= MAX_CAPACITY {
            self.size_limit = usize::MAX;
            return Ok(false);
        }

        let live = self.len();
        let new_capacity = target_capacity(self.capacity, live);
        if new_capacity <= self.capacity {
            self.size_limit = size_limit_for(self.capacity);
            return Ok(false);
        }

        debug!(
            "Resizing table: {} -> {} cells ({} primary + {} overflow keys)",
            self.capacity,
            new_capacity,
            self.primary_size(),
            self.victim_size()
        );
        self.rehash(new_capacity, |_| true)?;
        assert_eq!(self.len(), live, "resize must conserve every key");
        self.size_limit = size_limit_for(new_capacity);
        Ok(true)
    }

    /// Remove every key whose count is `<= min_count` and rehash the rest
    ///
    /// Returns the number of keys removed.
    ///
    /// # Errors
    /// Returns [`TableError::Allocation`] if the rebuilt arrays cannot be allocated.
    ///
    /// # Panics
    /// Panics if owner tags are allocated.
    pub fn regenerate(&mut self, min_count: i32) -> Result<usize, TableError> {
        assert!(
            self.owners.is_none(),
            "regenerate requires ownership to be cleared first"
        );
        let before = self.len();
        let removed = self.rehash(self.capacity, |cell| V::count(cell) > min_count)?;
        debug_assert_eq!(self.len() + removed, before);
        if removed > 0 {
            info!(
                "Regenerated table: removed {} of {} keys at depth <= {}",
                removed, before, min_count
            );
        }
        Ok(removed)
    }

    /// Move every entry accepted by `keep` into fresh arrays of `new_capacity`
    /// cells; returns how many entries were dropped
    fn rehash(
        &mut self,
        new_capacity: usize,
        mut keep: impl FnMut(&V::Cell) -> bool,
    ) -> Result<usize, TableError> {
        let slots = new_capacity + PROBE_WINDOW;
        let keys = try_alloc_slice("primary keys", slots, || AtomicU64::new(EMPTY_KEY))?;
        let cells = try_alloc_slice("primary values", slots, V::new_cell)?;
        let victims = VictimForest::for_capacity(new_capacity)?;

        let old_keys = std::mem::replace(&mut self.keys, keys);
        let old_cells = std::mem::replace(&mut self.cells, cells);
        let mut old_victims = std::mem::replace(&mut self.victims, victims);
        self.capacity = new_capacity;
        *self.size.get_mut() = 0;

        let mut removed = 0;
        let primary = old_keys
            .into_vec()
            .into_iter()
            .map(AtomicU64::into_inner)
            .zip(old_cells.into_vec())
            .filter(|(key, _)| *key != EMPTY_KEY);
        for (key, cell) in primary.chain(old_victims.drain()) {
            if keep(&cell) {
                self.place(key, cell);
            } else {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Insert an owned entry during a rehash; the key must be absent
    fn place(&mut self, key: u64, cell: V::Cell) {
        let start = (key % self.capacity as u64) as usize;
        for slot in start..start + PROBE_WINDOW {
            let current = self.keys[slot].get_mut();
            if *current == EMPTY_KEY {
                *current = key;
                self.cells[slot] = cell;
                *self.size.get_mut() += 1;
                return;
            }
            debug_assert_ne!(*current, key, "duplicate key during rehash");
        }
        self.victims.insert_owned(key, cell);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primes::is_prime;
    use crate::value::{Counter, ValueSet};

    #[test]
    fn test_target_capacity_doubles_within_band() {
        // 92 keys in 101 cells: doubling (212) is above the band [102, 158], so clamp
        let target = target_capacity(101, 92);
        assert!(is_prime(target as u64));
        assert_eq!(target, prime_at_least((92.0 / MIN_LOAD_FACTOR) as u64) as usize);

        // Heavily overloaded (overflow-heavy) table jumps past doubling
        let target = target_capacity(101, 1000);
        assert!(target as f64 >= 1000.0 / MAX_LOAD_FACTOR);
        assert!(target > 2 * 101);
    }

    #[test]
    fn test_target_capacity_never_exceeds_max() {
        assert_eq!(target_capacity(MAX_CAPACITY - 1000, MAX_CAPACITY), MAX_CAPACITY);
    }

    #[test]
    fn test_target_capacity_does_not_shrink_sparse_tables() {
        assert!(target_capacity(10_007, 10) <= 10_007);
    }

    #[test]
    fn test_resize_conserves_keys() {
        let mut table = HashArray::<Counter>::new(101, true).unwrap();
        for key in 0..600u64 {
            table.increment_by(key * 7919, (key % 5) as u32 + 1);
        }
        let before = table.primary_size() + table.victim_size();
        assert!(table.over_limit());
        assert!(table.victim_size() > 0);

        assert!(table.resize().unwrap());
        assert_eq!(table.primary_size() + table.victim_size(), before);
        assert!(table.capacity() > 101);
        assert!(is_prime(table.capacity() as u64));
        assert!(!table.over_limit());
        for key in 0..600u64 {
            assert_eq!(table.get_value(key * 7919), Some((key % 5) as i32 + 1));
        }
    }

    #[test]
    fn test_resize_not_needed_keeps_capacity() {
        let mut table = HashArray::<Counter>::new(1009, true).unwrap();
        table.increment(1);
        assert!(!table.resize().unwrap());
        assert_eq!(table.capacity(), 1009);
        assert_eq!(table.size_limit(), size_limit_for(1009));
    }

    #[test]
    fn test_non_growable_disables_limit() {
        let mut table = HashArray::<Counter>::new(101, false).unwrap();
        for key in 0..200 {
            table.increment(key);
        }
        assert!(!table.resize().unwrap());
        assert_eq!(table.capacity(), 101);
        assert_eq!(table.size_limit(), usize::MAX);
    }

    #[test]
    #[should_panic(expected = "resize requires ownership to be cleared first")]
    fn test_resize_with_ownership_panics() {
        let mut table = HashArray::<Counter>::new(101, true).unwrap();
        table.initialize_ownership().unwrap();
        let _ = table.resize();
    }

    #[test]
    fn test_regenerate_removes_low_depth() {
        let mut table = HashArray::<Counter>::new(101, false).unwrap();
        for (key, count) in [(11u64, 1), (22, 2), (33, 5), (44, 10)] {
            table.increment_by(key, count);
        }
        assert_eq!(table.regenerate(3).unwrap(), 2);
        assert!(!table.contains(11));
        assert!(!table.contains(22));
        assert_eq!(table.get_value(33), Some(5));
        assert_eq!(table.get_value(44), Some(10));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_regenerate_reaches_overflow_keys() {
        let mut table = HashArray::<Counter>::new(101, false).unwrap();
        let capacity = table.capacity() as u64;
        for i in 0..30u64 {
            table.increment_by(5 + i * capacity, if i % 2 == 0 { 1 } else { 4 });
        }
        assert!(table.victim_size() > 0);
        assert_eq!(table.regenerate(1).unwrap(), 15);
        assert_eq!(table.len(), 15);
        // Survivors now fit inside the probe window
        assert_eq!(table.victim_size(), 0);
        for i in (1..30u64).step_by(2) {
            assert_eq!(table.get_value(5 + i * capacity), Some(4));
        }
    }

    #[test]
    fn test_rehash_moves_value_sets() {
        let mut table = HashArray::<ValueSet>::new(31, true).unwrap();
        for key in 0..100u64 {
            table.set_value(key, key as i32);
            table.set_value(key, 1000);
        }
        table.resize().unwrap();
        let mut values = Vec::new();
        for key in 0..100u64 {
            assert!(table.get_values_into(key, &mut values));
            assert_eq!(values, vec![key as i32, 1000]);
        }
    }
}
