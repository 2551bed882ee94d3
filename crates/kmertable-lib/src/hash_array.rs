//! Open-addressed primary array with overflow delegation
//!
//! A key's home cell is `key % capacity` with `capacity` prime. Lookups and
//! inserts scan at most [`PROBE_WINDOW`] consecutive cells from the home
//! cell; the key array carries a tail of `PROBE_WINDOW` extra cells so the
//! window never wraps. A scan stops at:
//! 1. a cell holding the key (hit),
//! 2. an empty cell (miss; first-fit insertion point),
//! 3. the end of the window, in which case the key lives in (or goes to)
//!    the [`VictimForest`].
//!
//! Cells are claimed with a compare-and-swap on the key slot and never
//! return to empty while the table is shared, so a key can only ever be
//! found in one place. Restructuring (`resize`, `regenerate`, `clear`,
//! ownership setup/teardown) needs `&mut self`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::constants::{
    is_valid_key, EMPTY_KEY, MAX_CAPACITY, MAX_KEY_BITS, MAX_LOAD_FACTOR, MIN_CAPACITY, NO_OWNER,
    PROBE_WINDOW,
};
use crate::error::{try_alloc_slice, TableError};
use crate::kmer::gc_count;
use crate::ownership::OwnerTags;
use crate::primes::prime_at_least;
use crate::value::ValueShape;
use crate::victim::VictimForest;

/// Where a present key was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Index into the primary key array
    Primary(usize),
    /// Node in the overflow forest
    Overflow,
}

/// Fixed-capacity k-mer table: primary array plus overflow forest
pub struct HashArray<V: ValueShape> {
    pub(crate) keys: Box<[AtomicU64]>,
    pub(crate) cells: Box<[V::Cell]>,
    pub(crate) owners: Option<OwnerTags>,
    pub(crate) victims: VictimForest<V>,
    pub(crate) capacity: usize,
    pub(crate) size: AtomicUsize,
    pub(crate) size_limit: usize,
    pub(crate) growable: bool,
}

/// Resize threshold for a primary array of `capacity` cells
#[inline]
pub(crate) fn size_limit_for(capacity: usize) -> usize {
    (MAX_LOAD_FACTOR * capacity as f64) as usize
}

impl<V: ValueShape> HashArray<V> {
    /// Create a table whose capacity is the smallest prime `>= initial_size`
    ///
    /// # Arguments
    /// * `initial_size` - Capacity hint, clamped to `[MIN_CAPACITY, MAX_CAPACITY]`
    /// * `growable` - Whether [`resize`](Self::resize) may ever grow the table
    ///
    /// # Errors
    /// Returns [`TableError::Allocation`] if any array cannot be allocated.
    pub fn new(initial_size: usize, growable: bool) -> Result<Self, TableError> {
        let wanted = initial_size.clamp(MIN_CAPACITY, MAX_CAPACITY);
        let capacity = (prime_at_least(wanted as u64) as usize).min(MAX_CAPACITY);
        Self::with_capacity(capacity, growable)
    }

    pub(crate) fn with_capacity(capacity: usize, growable: bool) -> Result<Self, TableError> {
        let slots = capacity + PROBE_WINDOW;
        let keys = try_alloc_slice("primary keys", slots, || AtomicU64::new(EMPTY_KEY))?;
        let cells = try_alloc_slice("primary values", slots, V::new_cell)?;
        let victims = VictimForest::for_capacity(capacity)?;
        Ok(Self {
            keys,
            cells,
            owners: None,
            victims,
            capacity,
            size: AtomicUsize::new(0),
            size_limit: if growable { size_limit_for(capacity) } else { usize::MAX },
            growable,
        })
    }

    #[inline]
    fn home(&self, key: u64) -> usize {
        (key % self.capacity as u64) as usize
    }

    /// Find or create the entry for `key` and run `apply(cell, created)`
    fn upsert<R>(&self, key: u64, apply: impl FnOnce(&V::Cell, bool) -> R) -> R {
        assert!(
            is_valid_key(key),
            "key {:#x} does not fit in {} bits",
            key,
            MAX_KEY_BITS
        );
        let start = self.home(key);
        for slot in start..start + PROBE_WINDOW {
            let mut current = self.keys[slot].load(Ordering::Acquire);
            if current == EMPTY_KEY {
                match self.keys[slot].compare_exchange(
                    EMPTY_KEY,
                    key,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.size.fetch_add(1, Ordering::AcqRel);
                        return apply(&self.cells[slot], true);
                    }
                    Err(actual) => current = actual,
                }
            }
            if current == key {
                return apply(&self.cells[slot], false);
            }
        }
        self.victims.upsert(key, apply)
    }

    /// Run `f` on the cell of `key` if it is present
    fn read<R>(&self, key: u64, f: impl FnOnce(&V::Cell) -> R) -> Option<R> {
        match self.locate(key)? {
            Location::Primary(slot) => Some(f(&self.cells[slot])),
            Location::Overflow => self.victims.with_cell(key, f),
        }
    }

    /// Where `key` is stored, if anywhere
    pub fn locate(&self, key: u64) -> Option<Location> {
        if !is_valid_key(key) {
            return None;
        }
        let start = self.home(key);
        for slot in start..start + PROBE_WINDOW {
            let current = self.keys[slot].load(Ordering::Acquire);
            if current == key {
                return Some(Location::Primary(slot));
            }
            if current == EMPTY_KEY {
                return None;
            }
        }
        self.victims.contains(key).then_some(Location::Overflow)
    }

    /// Add one to the count of `key`, inserting it at 1; returns the new count
    #[inline]
    pub fn increment(&self, key: u64) -> i32 {
        self.increment_by(key, 1)
    }

    /// Add `amount` to the count of `key`, saturating at `i32::MAX`
    pub fn increment_by(&self, key: u64, amount: u32) -> i32 {
        self.upsert(key, |cell, _| V::increment(cell, amount))
    }

    /// Like [`increment`](Self::increment), but reports whether the key was new
    pub fn increment_and_report_created(&self, key: u64) -> bool {
        self.upsert(key, |cell, created| {
            V::increment(cell, 1);
            created
        })
    }

    /// Store `value` for `key`; returns whether the key was new
    ///
    /// Counters are overwritten; value sets gain `value` as a member.
    pub fn set_value(&self, key: u64, value: i32) -> bool {
        self.upsert(key, |cell, created| {
            V::set_value(cell, value);
            created
        })
    }

    /// Replace the value set of `key`; returns whether the key was new
    pub fn set_values(&self, key: u64, values: &[i32]) -> bool {
        self.upsert(key, |cell, created| {
            V::set_values(cell, values);
            created
        })
    }

    /// Insert `key` with `value` only if it is absent; returns whether it was inserted
    pub fn set_if_absent(&self, key: u64, value: i32) -> bool {
        self.upsert(key, |cell, created| {
            if created {
                V::set_value(cell, value);
            }
            created
        })
    }

    /// Primary value of `key`
    pub fn get_value(&self, key: u64) -> Option<i32> {
        self.read(key, V::value)
    }

    /// Fill `out` with the values of `key`; returns `false` (and leaves `out`
    /// empty) if the key is absent
    pub fn get_values_into(&self, key: u64, out: &mut Vec<i32>) -> bool {
        out.clear();
        self.read(key, |cell| V::values_into(cell, out)).is_some()
    }

    /// Depth of `key` (counter value or set size)
    pub fn count_of(&self, key: u64) -> Option<i32> {
        self.read(key, V::count)
    }

    /// Whether `key` is present
    #[inline]
    pub fn contains(&self, key: u64) -> bool {
        self.locate(key).is_some()
    }

    /// Keys held directly in the primary array
    #[inline]
    pub fn primary_size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Keys held in the overflow forest
    #[inline]
    pub fn victim_size(&self) -> usize {
        self.victims.size()
    }

    /// Total live keys
    #[inline]
    pub fn len(&self) -> usize {
        self.primary_size() + self.victim_size()
    }

    /// Whether the table holds no keys
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Primary array length (prime)
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live-key count above which the table wants to grow
    #[inline]
    pub fn size_limit(&self) -> usize {
        self.size_limit
    }

    /// Whether the table may grow on resize
    pub fn growable(&self) -> bool {
        self.growable
    }

    /// Whether the live-key count has crossed [`size_limit`](Self::size_limit)
    #[inline]
    pub fn over_limit(&self) -> bool {
        self.len() > self.size_limit
    }

    /// Live keys per primary cell
    pub fn load_factor(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    /// Number of overflow trees
    pub fn victim_roots(&self) -> usize {
        self.victims.num_roots()
    }

    /// Height of the deepest overflow tree
    pub fn victim_depth(&self) -> usize {
        self.victims.max_depth()
    }

    /// Rebuild each overflow tree as a balanced tree
    pub fn rebalance_victims(&mut self) {
        self.victims.rebalance();
    }

    /// Drop every key, keeping the current capacity
    pub fn clear(&mut self) {
        for key in self.keys.iter_mut() {
            *key.get_mut() = EMPTY_KEY;
        }
        for cell in self.cells.iter_mut() {
            *cell = V::new_cell();
        }
        *self.size.get_mut() = 0;
        self.victims.clear();
        if let Some(owners) = self.owners.as_mut() {
            owners.reset();
        }
    }

    // ---- ownership ----

    /// Allocate (or reset) owner tags for every slot and overflow node
    ///
    /// # Errors
    /// Returns [`TableError::Allocation`] if the tag array cannot be allocated.
    pub fn initialize_ownership(&mut self) -> Result<(), TableError> {
        match self.owners.as_mut() {
            Some(owners) => owners.reset(),
            None => self.owners = Some(OwnerTags::new(self.keys.len())?),
        }
        self.victims.reset_owners();
        Ok(())
    }

    /// Release the owner tags entirely
    pub fn clear_ownership(&mut self) {
        self.owners = None;
        self.victims.reset_owners();
    }

    /// Whether owner tags are allocated
    pub fn has_ownership(&self) -> bool {
        self.owners.is_some()
    }

    fn owner_tags(&self) -> &OwnerTags {
        match &self.owners {
            Some(owners) => owners,
            None => panic!("ownership is not initialized; call initialize_ownership first"),
        }
    }

    /// Claim `key` for `worker` (highest id wins); returns the resulting owner
    ///
    /// # Panics
    /// Panics if ownership is not initialized or `key` is absent.
    pub fn claim(&self, key: u64, worker: i32) -> i32 {
        let owners = self.owner_tags();
        match self.locate(key) {
            Some(Location::Primary(slot)) => owners.claim(slot, worker),
            Some(Location::Overflow) => match self.victims.claim(key, worker) {
                Some(owner) => owner,
                None => panic!("key {:#x} vanished from the overflow forest", key),
            },
            None => panic!("cannot claim absent key {:#x}", key),
        }
    }

    /// Release `key` if `worker` still owns it
    pub fn release(&self, key: u64, worker: i32) -> bool {
        let Some(owners) = self.owners.as_ref() else {
            return false;
        };
        match self.locate(key) {
            Some(Location::Primary(slot)) => owners.release(slot, worker),
            Some(Location::Overflow) => self.victims.release(key, worker),
            None => false,
        }
    }

    /// Current owner of `key`, or [`NO_OWNER`]
    pub fn owner_of(&self, key: u64) -> i32 {
        let Some(owners) = self.owners.as_ref() else {
            return NO_OWNER;
        };
        match self.locate(key) {
            Some(Location::Primary(slot)) => owners.owner_of(slot),
            Some(Location::Overflow) => self.victims.owner_of(key).unwrap_or(NO_OWNER),
            None => NO_OWNER,
        }
    }

    /// Whether any primary slot or overflow node is claimed
    pub fn any_claimed(&self) -> bool {
        self.owners.as_ref().is_some_and(OwnerTags::any_claimed) || self.victims.any_claimed()
    }

    // ---- traversal ----

    /// Visit every live entry (primary array first, then overflow) until `f` fails
    pub fn try_for_each_entry<E>(
        &self,
        mut f: impl FnMut(u64, &V::Cell) -> Result<(), E>,
    ) -> Result<(), E> {
        for (slot, key) in self.keys.iter().enumerate() {
            let key = key.load(Ordering::Acquire);
            if key != EMPTY_KEY {
                f(key, &self.cells[slot])?;
            }
        }
        self.victims.try_for_each(f)
    }

    /// Visit every live entry
    pub fn for_each_entry(&self, mut f: impl FnMut(u64, &V::Cell)) {
        let _ = self.try_for_each_entry(|key, cell| -> Result<(), ()> {
            f(key, cell);
            Ok(())
        });
    }

    /// Depth histogram: `hist[min(count, max)]` is bumped once per key
    ///
    /// `max` is capped at `i32::MAX`, the largest count a key can hold.
    pub fn fill_histogram(&self, max: usize) -> Vec<u64> {
        let mut hist = vec![0u64; bucket_count(max)];
        let max = hist.len() - 1;
        self.for_each_entry(|_, cell| {
            let count = V::count(cell).max(0) as usize;
            hist[count.min(max)] += 1;
        });
        hist
    }

    /// GC bases summed per depth bucket
    pub fn count_gc(&self, max: usize) -> Vec<u64> {
        let mut gc = vec![0u64; bucket_count(max)];
        let max = gc.len() - 1;
        self.for_each_entry(|key, cell| {
            let count = V::count(cell).max(0) as usize;
            gc[count.min(max)] += gc_count(key) as u64;
        });
        gc
    }
}

/// Length of a depth histogram whose last bucket is `max`
#[inline]
pub(crate) fn bucket_count(max: usize) -> usize {
    max.min(i32::MAX as usize) + 1
}
