//! Monotonic ownership tags
//!
//! Traversal workers coordinate by tagging keys with their worker id. A
//! claim only ever raises the tag: once a higher id holds a key, every
//! lower id observes that owner and backs off. Release hands a key back
//! only if the releasing worker still holds it.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::constants::NO_OWNER;
use crate::error::{try_alloc_slice, TableError};

/// Raise `tag` to `worker` unless a worker with an id `>= worker` holds it.
///
/// Returns the owner after the race resolves; the caller won iff the
/// result equals `worker`.
#[inline]
pub fn claim_tag(tag: &AtomicI32, worker: i32) -> i32 {
    let mut current = tag.load(Ordering::Acquire);
    while current < worker {
        match tag.compare_exchange_weak(current, worker, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return worker,
            Err(actual) => current = actual,
        }
    }
    current
}

/// Reset `tag` to [`NO_OWNER`] if `worker` still holds it
#[inline]
pub fn release_tag(tag: &AtomicI32, worker: i32) -> bool {
    tag.compare_exchange(worker, NO_OWNER, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// One owner tag per primary slot
pub struct OwnerTags {
    tags: Box<[AtomicI32]>,
}

impl OwnerTags {
    /// Allocate `len` unowned tags
    pub fn new(len: usize) -> Result<Self, TableError> {
        let tags = try_alloc_slice("owner tags", len, || AtomicI32::new(NO_OWNER))?;
        Ok(Self { tags })
    }

    /// Number of tags
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether there are no tags at all
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// See [`claim_tag`]
    #[inline]
    pub fn claim(&self, slot: usize, worker: i32) -> i32 {
        claim_tag(&self.tags[slot], worker)
    }

    /// See [`release_tag`]
    #[inline]
    pub fn release(&self, slot: usize, worker: i32) -> bool {
        release_tag(&self.tags[slot], worker)
    }

    /// Current owner of `slot`
    #[inline]
    pub fn owner_of(&self, slot: usize) -> i32 {
        self.tags[slot].load(Ordering::Acquire)
    }

    /// Return every slot to [`NO_OWNER`]
    pub fn reset(&mut self) {
        for tag in self.tags.iter_mut() {
            *tag.get_mut() = NO_OWNER;
        }
    }

    /// Whether any slot is currently claimed
    pub fn any_claimed(&self) -> bool {
        self.tags.iter().any(|t| t.load(Ordering::Acquire) != NO_OWNER)
    }
}
