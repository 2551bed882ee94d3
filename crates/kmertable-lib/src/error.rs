//! Error types surfaced by the table engine

use thiserror::Error;

/// Failures reported by table construction and bulk operations
#[derive(Error, Debug)]
pub enum TableError {
    /// A primary, value or owner array could not be allocated
    #[error("failed to allocate {what} for {len} slots")]
    Allocation {
        /// Which array was being allocated
        what: &'static str,
        /// Requested number of slots
        len: usize,
    },
    /// A configuration value is out of range
    #[error("invalid table configuration: {0}")]
    InvalidConfig(String),
    /// The worker pool for allocation or dumping could not be created
    #[error("failed to create thread pool: {0}")]
    ThreadPool(String),
    /// A shard was not produced by the allocation workers
    #[error("table shard {0} was not allocated")]
    MissingShard(usize),
    /// Dump text could not be parsed back
    #[error("malformed dump record at line {line}: {reason}")]
    MalformedDump {
        /// 1-based line number in the dump
        line: usize,
        /// What went wrong
        reason: String,
    },
    /// Underlying sink I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Allocate a boxed slice of `len` cells, reporting exhaustion instead of aborting
pub(crate) fn try_alloc_slice<T>(
    what: &'static str,
    len: usize,
    mut fill: impl FnMut() -> T,
) -> Result<Box<[T]>, TableError> {
    let mut cells = Vec::new();
    cells
        .try_reserve_exact(len)
        .map_err(|_| TableError::Allocation { what, len })?;
    cells.extend((0..len).map(|_| fill()));
    Ok(cells.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_alloc_slice() {
        let cells = try_alloc_slice("keys", 5, || 7u64).unwrap();
        assert_eq!(&*cells, &[7, 7, 7, 7, 7]);
    }

    #[test]
    fn test_try_alloc_slice_exhaustion() {
        let err = try_alloc_slice("keys", usize::MAX / 2, || 0u64).unwrap_err();
        assert!(matches!(err, TableError::Allocation { what: "keys", .. }));
        assert!(err.to_string().contains("keys"));
    }
}
