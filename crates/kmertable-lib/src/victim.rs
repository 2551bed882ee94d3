//! Overflow forest for keys that exhaust the primary probe window
//!
//! The forest is an arena of binary-search-tree nodes linked by `u32`
//! indices. Each key is routed to the tree rooted at `key % num_roots`
//! and ordered by its full value inside that tree. Nodes are only ever
//! appended while the table is live; they disappear through
//! [`VictimForest::drain`] or [`VictimForest::clear`], both of which need
//! exclusive access.
//!
//! Lookups and in-place updates of existing nodes share the forest's read
//! lock (cells and owner tags are themselves synchronized); creating a node
//! takes the write lock.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::constants::{MIN_VICTIM_ROOTS, NO_OWNER, VICTIM_ROOT_DIVISOR};
use crate::error::{try_alloc_slice, TableError};
use crate::ownership::{claim_tag, release_tag};
use crate::primes::prime_at_least;
use crate::value::ValueShape;

/// Null child/root link
const NIL: u32 = u32::MAX;

struct VictimNode<V: ValueShape> {
    key: u64,
    cell: V::Cell,
    owner: AtomicI32,
    left: u32,
    right: u32,
}

struct Arena<V: ValueShape> {
    roots: Box<[u32]>,
    nodes: Vec<VictimNode<V>>,
}

impl<V: ValueShape> Arena<V> {
    #[inline]
    fn find(&self, key: u64) -> Option<usize> {
        let mut idx = self.roots[(key % self.roots.len() as u64) as usize];
        while idx != NIL {
            let node = &self.nodes[idx as usize];
            if key == node.key {
                return Some(idx as usize);
            }
            idx = if key < node.key { node.left } else { node.right };
        }
        None
    }

    /// Link a new node for `key`; the caller guarantees the key is absent
    fn insert(&mut self, key: u64, cell: V::Cell) -> usize {
        let new_idx = self.nodes.len();
        assert!(new_idx < NIL as usize, "overflow forest is full");
        self.nodes.push(VictimNode {
            key,
            cell,
            owner: AtomicI32::new(NO_OWNER),
            left: NIL,
            right: NIL,
        });

        let root = (key % self.roots.len() as u64) as usize;
        let mut idx = self.roots[root];
        if idx == NIL {
            self.roots[root] = new_idx as u32;
            return new_idx;
        }
        loop {
            let node = &mut self.nodes[idx as usize];
            debug_assert_ne!(node.key, key, "duplicate key in overflow forest");
            let link = if key < node.key { &mut node.left } else { &mut node.right };
            if *link == NIL {
                *link = new_idx as u32;
                return new_idx;
            }
            idx = *link;
        }
    }

    fn depth_from(&self, root: u32) -> usize {
        let mut deepest = 0;
        let mut stack = Vec::new();
        if root != NIL {
            stack.push((root, 1));
        }
        while let Some((idx, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            let node = &self.nodes[idx as usize];
            for child in [node.left, node.right] {
                if child != NIL {
                    stack.push((child, depth + 1));
                }
            }
        }
        deepest
    }

    fn collect_in_order(&self, root: u32, out: &mut Vec<u32>) {
        let mut stack = Vec::new();
        let mut idx = root;
        while idx != NIL || !stack.is_empty() {
            while idx != NIL {
                stack.push(idx);
                idx = self.nodes[idx as usize].left;
            }
            if let Some(top) = stack.pop() {
                out.push(top);
                idx = self.nodes[top as usize].right;
            }
        }
    }

    fn build_balanced(&mut self, sorted: &[u32]) -> u32 {
        if sorted.is_empty() {
            return NIL;
        }
        let mid = sorted.len() / 2;
        let left = self.build_balanced(&sorted[..mid]);
        let right = self.build_balanced(&sorted[mid + 1..]);
        let node = &mut self.nodes[sorted[mid] as usize];
        node.left = left;
        node.right = right;
        sorted[mid]
    }
}

/// Per-table forest of overflow ("victim") trees
pub struct VictimForest<V: ValueShape> {
    arena: RwLock<Arena<V>>,
    size: AtomicUsize,
}

impl<V: ValueShape> VictimForest<V> {
    /// Create a forest with `num_roots` independent trees
    pub fn new(num_roots: usize) -> Result<Self, TableError> {
        let roots = try_alloc_slice("overflow roots", num_roots.max(1), || NIL)?;
        Ok(Self {
            arena: RwLock::new(Arena { roots, nodes: Vec::new() }),
            size: AtomicUsize::new(0),
        })
    }

    /// Create a forest sized for a primary array of `capacity` cells
    pub fn for_capacity(capacity: usize) -> Result<Self, TableError> {
        let wanted = (capacity / VICTIM_ROOT_DIVISOR).max(MIN_VICTIM_ROOTS);
        Self::new(prime_at_least(wanted as u64) as usize)
    }

    /// Number of keys held in the forest
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Number of tree roots
    pub fn num_roots(&self) -> usize {
        self.arena.read().roots.len()
    }

    /// Whether `key` is stored in the forest
    pub fn contains(&self, key: u64) -> bool {
        self.arena.read().find(key).is_some()
    }

    /// Run `f` on the cell of `key`, if present
    pub fn with_cell<R>(&self, key: u64, f: impl FnOnce(&V::Cell) -> R) -> Option<R> {
        let arena = self.arena.read();
        arena.find(key).map(|idx| f(&arena.nodes[idx].cell))
    }

    /// Find or create the node for `key` and run `apply(cell, created)` on it
    pub fn upsert<R>(&self, key: u64, apply: impl FnOnce(&V::Cell, bool) -> R) -> R {
        {
            let arena = self.arena.read();
            if let Some(idx) = arena.find(key) {
                return apply(&arena.nodes[idx].cell, false);
            }
        }
        let mut arena = self.arena.write();
        // Another writer may have linked the key between the two locks
        if let Some(idx) = arena.find(key) {
            return apply(&arena.nodes[idx].cell, false);
        }
        let idx = arena.insert(key, V::new_cell());
        self.size.fetch_add(1, Ordering::AcqRel);
        apply(&arena.nodes[idx].cell, true)
    }

    /// Move an existing cell into the forest (rehash path)
    pub fn insert_owned(&mut self, key: u64, cell: V::Cell) {
        let arena = self.arena.get_mut();
        debug_assert!(arena.find(key).is_none());
        arena.insert(key, cell);
        *self.size.get_mut() += 1;
    }

    /// Claim `key` for `worker`; `None` if the key is not in the forest
    pub fn claim(&self, key: u64, worker: i32) -> Option<i32> {
        let arena = self.arena.read();
        arena
            .find(key)
            .map(|idx| claim_tag(&arena.nodes[idx].owner, worker))
    }

    /// Release `key` if `worker` owns it
    pub fn release(&self, key: u64, worker: i32) -> bool {
        let arena = self.arena.read();
        arena
            .find(key)
            .is_some_and(|idx| release_tag(&arena.nodes[idx].owner, worker))
    }

    /// Current owner of `key`; `None` if the key is not in the forest
    pub fn owner_of(&self, key: u64) -> Option<i32> {
        let arena = self.arena.read();
        arena
            .find(key)
            .map(|idx| arena.nodes[idx].owner.load(Ordering::Acquire))
    }

    /// Clear every node's owner tag
    pub fn reset_owners(&mut self) {
        for node in self.arena.get_mut().nodes.iter_mut() {
            *node.owner.get_mut() = NO_OWNER;
        }
    }

    /// Whether any node is currently claimed
    pub fn any_claimed(&self) -> bool {
        self.arena
            .read()
            .nodes
            .iter()
            .any(|n| n.owner.load(Ordering::Acquire) != NO_OWNER)
    }

    /// Visit every node until `f` fails
    pub fn try_for_each<E>(&self, mut f: impl FnMut(u64, &V::Cell) -> Result<(), E>) -> Result<(), E> {
        let arena = self.arena.read();
        for node in &arena.nodes {
            f(node.key, &node.cell)?;
        }
        Ok(())
    }

    /// Visit every node
    pub fn for_each(&self, mut f: impl FnMut(u64, &V::Cell)) {
        let _ = self.try_for_each(|key, cell| -> Result<(), ()> {
            f(key, cell);
            Ok(())
        });
    }

    /// Remove every node, handing back keys and cells
    pub fn drain(&mut self) -> Vec<(u64, V::Cell)> {
        let arena = self.arena.get_mut();
        arena.roots.fill(NIL);
        *self.size.get_mut() = 0;
        std::mem::take(&mut arena.nodes)
            .into_iter()
            .map(|node| (node.key, node.cell))
            .collect()
    }

    /// Remove every node
    pub fn clear(&mut self) {
        let arena = self.arena.get_mut();
        arena.roots.fill(NIL);
        arena.nodes = Vec::new();
        *self.size.get_mut() = 0;
    }

    /// Rebuild every tree as a balanced tree over its in-order key list
    pub fn rebalance(&mut self) {
        let arena = self.arena.get_mut();
        let mut sorted = Vec::new();
        for r in 0..arena.roots.len() {
            let root = arena.roots[r];
            if root == NIL {
                continue;
            }
            sorted.clear();
            arena.collect_in_order(root, &mut sorted);
            arena.roots[r] = arena.build_balanced(&sorted);
        }
    }

    /// Height of the deepest tree
    pub fn max_depth(&self) -> usize {
        let arena = self.arena.read();
        arena
            .roots
            .iter()
            .map(|&root| arena.depth_from(root))
            .max()
            .unwrap_or(0)
    }
}
