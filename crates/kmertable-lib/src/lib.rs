// kmertable: concurrent k-mer hash tables
//
// Sharded, fixed-capacity tables keyed by 2-bit packed k-mers, with
// bounded linear probing, per-bucket overflow trees, a monotonic ownership
// protocol for traversal workers and parallel text export.

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod config;
pub mod constants;
pub mod dump;
pub mod encoding;
pub mod error;
pub mod hash_array;
pub mod kmer;
pub mod ownership;
pub mod primes;
pub mod resize;
pub mod shard_set;
pub mod table;
pub mod value;
pub mod victim;

// Re-export common types at crate root
pub use config::TableConfig;
pub use dump::{parse_dump, DumpFormat, DumpMode, DumpRecord, DumpReport, DumpSink};
pub use encoding::{decode_kmer, encode_kmer, EncodingError};
pub use error::TableError;
pub use hash_array::{HashArray, Location};
pub use kmer::{canonical, gc_count, reverse_complement, KmerIterator};
pub use shard_set::ShardSet;
pub use table::{KmerTable, TableShard};
pub use value::{Counter, ValueSet, ValueShape};

/// Version information
pub fn version() -> (u8, u8, u8) {
    constants::VERSION
}
