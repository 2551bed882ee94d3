//! Partitioned table: `ways` independent shards
//!
//! A key always lives in shard `key % ways`. Shards are allocated in
//! parallel by a small pool of allocator workers, each building a
//! round-robin subset. Bulk maintenance (regenerate, histograms, dump) fans
//! out over the shards on the set's rayon pool.

use rayon::prelude::*;
use tracing::{error, info, warn};

use crate::config::TableConfig;
use crate::dump::{dump_shards, DumpFormat, DumpReport, DumpSink};
use crate::error::TableError;
use crate::hash_array::bucket_count;
use crate::table::{KmerTable, TableShard};
use crate::value::ValueShape;

/// Upper bound on allocator workers; allocation is memory-bound
const MAX_ALLOCATOR_WORKERS: usize = 2;

/// A full k-mer table split across independent shards
pub struct ShardSet<V: ValueShape> {
    shards: Vec<TableShard<V>>,
    config: TableConfig,
    pool: rayon::ThreadPool,
}

impl<V: ValueShape> ShardSet<V> {
    /// Validate `config` and allocate every shard
    ///
    /// # Errors
    /// Returns [`TableError::InvalidConfig`] for a bad configuration,
    /// [`TableError::ThreadPool`] if the worker pool cannot start, and
    /// [`TableError::Allocation`] if any shard cannot be allocated.
    pub fn new(config: TableConfig) -> Result<Self, TableError> {
        config.validate()?;
        let threads = config.effective_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| TableError::ThreadPool(e.to_string()))?;

        let shards = allocate_shards(&config, threads).map_err(|e| {
            error!("Shard allocation failed: {}", e);
            e
        })?;
        info!(
            "Allocated {} {} shards of capacity {}",
            shards.len(),
            V::NAME,
            shards.first().map_or(0, |s| s.capacity())
        );
        Ok(Self { shards, config, pool })
    }

    /// Configuration the set was built with
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Number of shards
    pub fn ways(&self) -> usize {
        self.shards.len()
    }

    /// Shard index owning `key`
    #[inline]
    pub fn shard_index(&self, key: u64) -> usize {
        (key % self.shards.len() as u64) as usize
    }

    /// Shard owning `key`
    #[inline]
    pub fn shard_for(&self, key: u64) -> &TableShard<V> {
        &self.shards[self.shard_index(key)]
    }

    /// Shard `index`
    pub fn shard(&self, index: usize) -> Option<&TableShard<V>> {
        self.shards.get(index)
    }

    /// All shards in index order
    pub fn shards(&self) -> &[TableShard<V>] {
        &self.shards
    }

    /// Keys held in overflow forests across all shards
    pub fn victim_size(&self) -> usize {
        self.shards.iter().map(TableShard::victim_size).sum()
    }

    /// Increment every key in `keys` in parallel; returns how many were new
    pub fn increment_all(&self, keys: &[u64]) -> usize {
        self.pool.install(|| {
            keys.par_iter()
                .filter(|&&key| self.increment_and_report_created(key))
                .count()
        })
    }

    /// Rebuild every overflow tree balanced
    pub fn rebalance_victims(&self) {
        self.pool
            .install(|| self.shards.par_iter().for_each(TableShard::rebalance_victims));
    }

    /// Drop every key in every shard
    pub fn clear(&self) {
        self.pool.install(|| self.shards.par_iter().for_each(TableShard::clear));
    }

    /// Write every entry accepted by `format` to `sink`
    ///
    /// Keys are always decoded with the set's configured `k`; a `format.k`
    /// that disagrees is overridden. Drain workers keep going when one of
    /// them fails; the report's `success` is the AND of every worker's outcome.
    pub fn dump(&self, sink: &dyn DumpSink, format: &DumpFormat) -> DumpReport {
        let mut format = format.clone();
        if format.k != self.config.k {
            warn!(
                "Dump format has k = {}, using the table's k = {}",
                format.k, self.config.k
            );
            format.k = self.config.k;
        }
        let workers = self.pool.current_num_threads().min(self.shards.len());
        let report = dump_shards(
            &self.shards,
            &self.pool,
            workers,
            sink,
            &format,
            self.config.dump_buffer_bytes,
        );
        info!(
            "Dumped {} entries from {} shards (success = {})",
            report.entries,
            self.shards.len(),
            report.success
        );
        report
    }

    fn reduce_buckets(
        &self,
        max: usize,
        per_shard: impl Fn(&TableShard<V>) -> Vec<u64> + Send + Sync,
    ) -> Vec<u64> {
        self.pool.install(|| {
            self.shards
                .par_iter()
                .map(per_shard)
                .reduce(
                    || vec![0u64; bucket_count(max)],
                    |mut acc, part| {
                        for (a, p) in acc.iter_mut().zip(part) {
                            *a += p;
                        }
                        acc
                    },
                )
        })
    }
}

/// Build `config.ways` shards on `min(threads, 2, ways)` allocator workers
fn allocate_shards<V: ValueShape>(
    config: &TableConfig,
    threads: usize,
) -> Result<Vec<TableShard<V>>, TableError> {
    let ways = config.ways;
    let workers = threads.min(MAX_ALLOCATOR_WORKERS).min(ways).max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| TableError::ThreadPool(e.to_string()))?;

    let built: Vec<Vec<(usize, TableShard<V>)>> = pool.install(|| {
        (0..workers)
            .into_par_iter()
            .map(|worker| {
                (worker..ways)
                    .step_by(workers)
                    .map(|index| {
                        TableShard::new(config.initial_size, config.auto_resize, config.growable)
                            .map(|shard| (index, shard))
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()
    })?;

    let mut slots: Vec<Option<TableShard<V>>> = (0..ways).map(|_| None).collect();
    for (index, shard) in built.into_iter().flatten() {
        slots[index] = Some(shard);
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(index, shard)| shard.ok_or(TableError::MissingShard(index)))
        .collect()
}

impl<V: ValueShape> KmerTable for ShardSet<V> {
    fn increment(&self, key: u64) -> i32 {
        self.shard_for(key).increment(key)
    }

    fn increment_by(&self, key: u64, amount: u32) -> i32 {
        self.shard_for(key).increment_by(key, amount)
    }

    fn increment_and_report_created(&self, key: u64) -> bool {
        self.shard_for(key).increment_and_report_created(key)
    }

    fn set_value(&self, key: u64, value: i32) -> bool {
        self.shard_for(key).set_value(key, value)
    }

    fn set_values(&self, key: u64, values: &[i32]) -> bool {
        self.shard_for(key).set_values(key, values)
    }

    fn set_if_absent(&self, key: u64, value: i32) -> bool {
        self.shard_for(key).set_if_absent(key, value)
    }

    fn get_value(&self, key: u64) -> Option<i32> {
        self.shard_for(key).get_value(key)
    }

    fn get_values_into(&self, key: u64, out: &mut Vec<i32>) -> bool {
        self.shard_for(key).get_values_into(key, out)
    }

    fn contains(&self, key: u64) -> bool {
        self.shard_for(key).contains(key)
    }

    fn size(&self) -> usize {
        self.shards.iter().map(KmerTable::size).sum()
    }

    /// Sum of all shard capacities
    fn capacity(&self) -> usize {
        self.shards.iter().map(KmerTable::capacity).sum()
    }

    fn claim(&self, key: u64, worker: i32) -> i32 {
        self.shard_for(key).claim(key, worker)
    }

    fn release(&self, key: u64, worker: i32) -> bool {
        self.shard_for(key).release(key, worker)
    }

    fn owner_of(&self, key: u64) -> i32 {
        self.shard_for(key).owner_of(key)
    }

    fn initialize_ownership(&self) -> Result<(), TableError> {
        self.pool.install(|| {
            self.shards
                .par_iter()
                .try_for_each(KmerTable::initialize_ownership)
        })
    }

    fn clear_ownership(&self) {
        self.shards.iter().for_each(KmerTable::clear_ownership);
    }

    fn resize(&self) -> Result<bool, TableError> {
        let grown = self.pool.install(|| {
            self.shards
                .par_iter()
                .map(KmerTable::resize)
                .collect::<Result<Vec<bool>, _>>()
        })?;
        Ok(grown.into_iter().any(|g| g))
    }

    fn regenerate(&self, min_count: i32) -> Result<usize, TableError> {
        let before = self.size();
        let removed: usize = self
            .pool
            .install(|| {
                self.shards
                    .par_iter()
                    .map(|shard| shard.regenerate(min_count))
                    .collect::<Result<Vec<usize>, _>>()
            })?
            .into_iter()
            .sum();
        info!(
            "Regenerated {} shards: removed {} of {} keys",
            self.shards.len(),
            removed,
            before
        );
        Ok(removed)
    }

    fn fill_histogram(&self, max: usize) -> Vec<u64> {
        self.reduce_buckets(max, |shard| shard.fill_histogram(max))
    }

    fn count_gc(&self, max: usize) -> Vec<u64> {
        self.reduce_buckets(max, |shard| shard.count_gc(max))
    }
}
