//! Text export of table contents
//!
//! Each live entry becomes one record:
//! - text mode: `<bases>\t<count>\n`, or `<bases>\t<v1>,<v2>,...\n` for value sets
//! - FASTA mode: `><count or values>\n<bases>\n`
//!
//! In numeric mode the bases are replaced by the key in lowercase hex.
//!
//! Dumping a [`ShardSet`](crate::ShardSet) runs a small set of drain workers
//! that share an atomic shard cursor. Each worker formats whole shards into a
//! private buffer and hands the buffer to the [`DumpSink`] once it passes the
//! flush threshold, so the sink sees large appends and never a torn record.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rayon::ThreadPool;
use tracing::{debug, warn};

use crate::constants::{MAX_K, NOT_PRESENT};
use crate::encoding::{encode_kmer, write_bases};
use crate::error::TableError;
use crate::table::TableShard;
use crate::value::ValueShape;

/// Record layout of a dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpMode {
    /// `<bases>\t<value>` per line
    #[default]
    Text,
    /// `><value>` header line followed by the bases
    Fasta,
}

/// How entries are rendered and which of them are written
#[derive(Debug, Clone)]
pub struct DumpFormat {
    /// K-mer length used to decode keys into bases
    pub k: usize,
    /// Record layout
    pub mode: DumpMode,
    /// Print keys as hex instead of bases
    pub numeric: bool,
    /// Skip entries whose depth is below this
    pub min_count: i32,
    /// Skip entries whose depth is above this
    pub max_count: i32,
}

impl Default for DumpFormat {
    fn default() -> Self {
        Self {
            k: MAX_K,
            mode: DumpMode::Text,
            numeric: false,
            min_count: 0,
            max_count: i32::MAX,
        }
    }
}

impl DumpFormat {
    /// Text-mode format for `k`-mers with no depth filter
    pub fn text(k: usize) -> Self {
        Self { k, ..Self::default() }
    }

    /// FASTA-mode format for `k`-mers with no depth filter
    pub fn fasta(k: usize) -> Self {
        Self { k, mode: DumpMode::Fasta, ..Self::default() }
    }

    /// Whether an entry of depth `count` passes the filter
    #[inline]
    pub fn accepts(&self, count: i32) -> bool {
        count >= self.min_count && count <= self.max_count
    }
}

/// Destination of dump output, shared by every drain worker
///
/// Implementations serialize concurrent appends internally; one call's bytes
/// must land contiguously.
pub trait DumpSink: Sync {
    /// Append `bytes` to the output
    fn append(&self, bytes: &[u8]) -> std::io::Result<()>;
}

impl<W: Write + Send> DumpSink for Mutex<W> {
    fn append(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.lock().write_all(bytes)
    }
}

/// Outcome of a parallel dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpReport {
    /// `false` if any worker failed to write
    pub success: bool,
    /// Records formatted across all workers
    pub entries: usize,
}

pub(crate) fn push_decimal(out: &mut Vec<u8>, n: i32) {
    // Writing into a Vec cannot fail
    let _ = write!(out, "{}", n);
}

fn push_hex(out: &mut Vec<u8>, key: u64) {
    let _ = write!(out, "{:x}", key);
}

fn push_key(out: &mut Vec<u8>, key: u64, format: &DumpFormat) {
    if format.numeric {
        push_hex(out, key);
    } else {
        write_bases(key, format.k, out);
    }
}

/// Append the record for one entry to `out`
pub fn write_entry<V: ValueShape>(out: &mut Vec<u8>, key: u64, cell: &V::Cell, format: &DumpFormat) {
    match format.mode {
        DumpMode::Text => {
            push_key(out, key, format);
            out.push(b'\t');
            V::write_value(cell, out);
            out.push(b'\n');
        }
        DumpMode::Fasta => {
            out.push(b'>');
            V::write_value(cell, out);
            out.push(b'\n');
            push_key(out, key, format);
            out.push(b'\n');
        }
    }
}

/// Drain `shards` into `sink` with up to `workers` threads of `pool`
pub(crate) fn dump_shards<V: ValueShape>(
    shards: &[TableShard<V>],
    pool: &ThreadPool,
    workers: usize,
    sink: &dyn DumpSink,
    format: &DumpFormat,
    buffer_bytes: usize,
) -> DumpReport {
    let cursor = AtomicUsize::new(0);
    let success = AtomicBool::new(true);
    let entries = AtomicUsize::new(0);
    let workers = workers.clamp(1, shards.len().max(1));

    debug!("Dumping {} shards with {} workers", shards.len(), workers);
    pool.scope(|scope| {
        for worker in 0..workers {
            let (cursor, success, entries) = (&cursor, &success, &entries);
            scope.spawn(move |_| {
                let mut buffer = Vec::with_capacity(buffer_bytes + 256);
                let mut written = 0usize;
                let result = drain_worker(
                    shards,
                    cursor,
                    sink,
                    format,
                    buffer_bytes,
                    &mut buffer,
                    &mut written,
                );
                entries.fetch_add(written, Ordering::Relaxed);
                if let Err(e) = result {
                    warn!("Dump worker {} failed: {}", worker, e);
                    success.store(false, Ordering::Release);
                }
            });
        }
    });

    DumpReport {
        success: success.load(Ordering::Acquire),
        entries: entries.load(Ordering::Relaxed),
    }
}

fn drain_worker<V: ValueShape>(
    shards: &[TableShard<V>],
    cursor: &AtomicUsize,
    sink: &dyn DumpSink,
    format: &DumpFormat,
    buffer_bytes: usize,
    buffer: &mut Vec<u8>,
    written: &mut usize,
) -> std::io::Result<()> {
    loop {
        let index = cursor.fetch_add(1, Ordering::AcqRel);
        let Some(shard) = shards.get(index) else {
            break;
        };
        let array = shard.read();
        array.try_for_each_entry(|key, cell| -> std::io::Result<()> {
            if !format.accepts(V::count(cell)) {
                return Ok(());
            }
            write_entry::<V>(buffer, key, cell, format);
            *written += 1;
            if buffer.len() >= buffer_bytes {
                sink.append(buffer.as_slice())?;
                buffer.clear();
            }
            Ok(())
        })?;
    }
    if !buffer.is_empty() {
        sink.append(buffer.as_slice())?;
        buffer.clear();
    }
    Ok(())
}

/// One record read back from a dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRecord {
    /// Encoded k-mer
    pub key: u64,
    /// The count, or the value list of a set
    pub values: Vec<i32>,
}

/// Parse text or FASTA dump output produced with `format`
///
/// Blank lines are ignored. Value lists stop at the first [`NOT_PRESENT`].
pub fn parse_dump(data: &[u8], format: &DumpFormat) -> Result<Vec<DumpRecord>, TableError> {
    let text = std::str::from_utf8(data).map_err(|e| TableError::MalformedDump {
        line: 0,
        reason: e.to_string(),
    })?;
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line))
        .filter(|(_, line)| !line.is_empty());
    let mut records = Vec::new();

    match format.mode {
        DumpMode::Text => {
            for (line_no, line) in lines {
                let (kmer, values) = line.split_once('\t').ok_or_else(|| malformed(line_no, "missing tab"))?;
                records.push(DumpRecord {
                    key: parse_key(kmer, format, line_no)?,
                    values: parse_values(values, line_no)?,
                });
            }
        }
        DumpMode::Fasta => {
            while let Some((line_no, header)) = lines.next() {
                let values = header
                    .strip_prefix('>')
                    .ok_or_else(|| malformed(line_no, "expected '>' header"))?;
                let (seq_no, kmer) = lines
                    .next()
                    .ok_or_else(|| malformed(line_no, "header without sequence"))?;
                records.push(DumpRecord {
                    key: parse_key(kmer, format, seq_no)?,
                    values: parse_values(values, line_no)?,
                });
            }
        }
    }
    Ok(records)
}

fn malformed(line: usize, reason: impl Into<String>) -> TableError {
    TableError::MalformedDump { line, reason: reason.into() }
}

fn parse_key(field: &str, format: &DumpFormat, line: usize) -> Result<u64, TableError> {
    if format.numeric {
        return u64::from_str_radix(field, 16).map_err(|e| malformed(line, e.to_string()));
    }
    if field.len() != format.k {
        return Err(malformed(
            line,
            format!("expected {} bases, found {}", format.k, field.len()),
        ));
    }
    encode_kmer(field.as_bytes()).map_err(|e| malformed(line, e.to_string()))
}

fn parse_values(field: &str, line: usize) -> Result<Vec<i32>, TableError> {
    let mut values = Vec::new();
    if field.is_empty() {
        return Ok(values);
    }
    for part in field.split(',') {
        let v: i32 = part
            .trim()
            .parse()
            .map_err(|_| malformed(line, format!("bad value {:?}", part)))?;
        if v == NOT_PRESENT {
            break;
        }
        values.push(v);
    }
    Ok(values)
}
