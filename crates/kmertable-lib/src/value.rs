//! Value shapes stored alongside keys
//!
//! A table is parameterized by a [`ValueShape`], which fixes what lives in
//! each occupied slot: a single saturating counter ([`Counter`]) or a short
//! list of integers ([`ValueSet`]). Cells are mutated through `&self` so the
//! primary array and the overflow forest can update them without holding
//! the shard's structural lock exclusively.

use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;

use crate::constants::NOT_PRESENT;
use crate::dump::push_decimal;

/// Policy describing the per-key payload of a table
pub trait ValueShape: Send + Sync + 'static {
    /// Storage for one key's value(s)
    type Cell: Send + Sync;

    /// Human-readable shape name, used in diagnostics
    const NAME: &'static str;

    /// A cell for a freshly created key
    fn new_cell() -> Self::Cell;

    /// Add `amount` to the count, saturating; returns the new count
    fn increment(cell: &Self::Cell, amount: u32) -> i32 {
        let _ = (cell, amount);
        unsupported(Self::NAME, "increment")
    }

    /// Store a single value
    fn set_value(cell: &Self::Cell, value: i32);

    /// Replace the cell contents with `values`
    fn set_values(cell: &Self::Cell, values: &[i32]) {
        let _ = (cell, values);
        unsupported(Self::NAME, "set_values")
    }

    /// The primary value, or [`NOT_PRESENT`] if the cell holds none
    fn value(cell: &Self::Cell) -> i32;

    /// Append every value in the cell to `out`
    fn values_into(cell: &Self::Cell, out: &mut Vec<i32>);

    /// Depth of the key: the counter, or the number of values in a set
    fn count(cell: &Self::Cell) -> i32;

    /// Append the dump text of the cell (`17` or `3,9,12`)
    fn write_value(cell: &Self::Cell, out: &mut Vec<u8>);
}

#[cold]
#[track_caller]
fn unsupported(shape: &str, op: &str) -> ! {
    panic!("unsupported operation `{}` on a {} table", op, shape)
}

/// One saturating `i32` counter per key
#[derive(Debug, Clone, Copy, Default)]
pub struct Counter;

impl ValueShape for Counter {
    type Cell = AtomicI32;

    const NAME: &'static str = "counter";

    #[inline]
    fn new_cell() -> AtomicI32 {
        AtomicI32::new(0)
    }

    #[inline]
    fn increment(cell: &AtomicI32, amount: u32) -> i32 {
        let amount = i32::try_from(amount).unwrap_or(i32::MAX);
        let previous = cell
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_add(amount))
            })
            .unwrap_or_else(|c| c);
        previous.saturating_add(amount)
    }

    #[inline]
    fn set_value(cell: &AtomicI32, value: i32) {
        cell.store(value, Ordering::Release);
    }

    #[inline]
    fn value(cell: &AtomicI32) -> i32 {
        cell.load(Ordering::Acquire)
    }

    fn values_into(cell: &AtomicI32, out: &mut Vec<i32>) {
        out.push(Self::value(cell));
    }

    #[inline]
    fn count(cell: &AtomicI32) -> i32 {
        Self::value(cell)
    }

    fn write_value(cell: &AtomicI32, out: &mut Vec<u8>) {
        push_decimal(out, Self::value(cell));
    }
}

/// A short list of distinct non-negative integers per key
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueSet;

impl ValueShape for ValueSet {
    type Cell = Mutex<Vec<i32>>;

    const NAME: &'static str = "value-set";

    #[inline]
    fn new_cell() -> Mutex<Vec<i32>> {
        Mutex::new(Vec::new())
    }

    /// Adds `value` to the set unless it is already a member
    fn set_value(cell: &Mutex<Vec<i32>>, value: i32) {
        assert!(value >= 0, "set values must be non-negative, got {}", value);
        let mut values = cell.lock();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    /// Overwrites the set; input is truncated at the first [`NOT_PRESENT`]
    fn set_values(cell: &Mutex<Vec<i32>>, values: &[i32]) {
        let mut stored = cell.lock();
        stored.clear();
        stored.extend(values.iter().copied().take_while(|&v| v != NOT_PRESENT));
    }

    fn value(cell: &Mutex<Vec<i32>>) -> i32 {
        cell.lock().first().copied().unwrap_or(NOT_PRESENT)
    }

    fn values_into(cell: &Mutex<Vec<i32>>, out: &mut Vec<i32>) {
        out.extend_from_slice(&cell.lock());
    }

    fn count(cell: &Mutex<Vec<i32>>) -> i32 {
        i32::try_from(cell.lock().len()).unwrap_or(i32::MAX)
    }

    fn write_value(cell: &Mutex<Vec<i32>>, out: &mut Vec<u8>) {
        for (i, &v) in cell.lock().iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            push_decimal(out, v);
        }
    }
}
