//! Configuration for k-mer table shard sets
//!
//! Collects the options a driver passes down to the engine: shard count,
//! starting capacity, k-mer length, growth policy and thread budget.

use crate::constants::{DEFAULT_DUMP_BUFFER_BYTES, MAX_CAPACITY, MAX_K, MIN_K};
use crate::error::TableError;

/// Configuration parameters for a [`ShardSet`](crate::ShardSet)
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Number of independent shards the key space is split into
    pub ways: usize,

    /// Starting capacity hint per shard (rounded up to a prime)
    pub initial_size: usize,

    /// K-mer length (1..=31), used to decode keys when dumping
    pub k: usize,

    /// Resize a shard synchronously once an insertion pushes it past its limit
    pub auto_resize: bool,

    /// Whether shards may ever grow
    pub growable: bool,

    /// Number of threads for parallel operations (0 = all available cores)
    pub threads: usize,

    /// Per-worker dump buffer size before flushing to the sink
    pub dump_buffer_bytes: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            ways: 31,
            initial_size: 242_000,
            k: MAX_K,
            auto_resize: true,
            growable: true,
            threads: 0, // 0 = use all available cores
            dump_buffer_bytes: DEFAULT_DUMP_BUFFER_BYTES,
        }
    }
}

impl TableConfig {
    /// Create a configuration with the given k-mer length and shard count
    pub fn new(k: usize, ways: usize) -> Result<Self, TableError> {
        let config = Self {
            k,
            ways,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<(), TableError> {
        if self.ways == 0 {
            return Err(TableError::InvalidConfig("ways must be at least 1".into()));
        }
        if self.k < MIN_K || self.k > MAX_K {
            return Err(TableError::InvalidConfig(format!(
                "k must be in range [{}, {}], got k={}",
                MIN_K, MAX_K, self.k
            )));
        }
        if self.initial_size == 0 || self.initial_size > MAX_CAPACITY {
            return Err(TableError::InvalidConfig(format!(
                "initial_size must be in range [1, {}], got {}",
                MAX_CAPACITY, self.initial_size
            )));
        }
        if self.auto_resize && !self.growable {
            return Err(TableError::InvalidConfig(
                "auto_resize requires a growable table".into(),
            ));
        }
        if self.dump_buffer_bytes == 0 {
            return Err(TableError::InvalidConfig(
                "dump_buffer_bytes must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Thread count with 0 resolved to the available parallelism
    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.threads
        }
    }

    /// Log configuration parameters via tracing
    pub fn print(&self) {
        tracing::info!("Table Configuration:");
        tracing::info!("  ways = {}", self.ways);
        tracing::info!("  k = {}", self.k);
        tracing::info!("  initial_size = {}", self.initial_size);
        if self.threads == 0 {
            tracing::info!("  threads = all available cores");
        } else {
            tracing::info!("  threads = {}", self.threads);
        }
        tracing::debug!("  auto_resize = {}", self.auto_resize);
        tracing::debug!("  growable = {}", self.growable);
        tracing::debug!("  dump_buffer_bytes = {}", self.dump_buffer_bytes);
    }
}
