//! Integration tests for sharded k-mer tables
//!
//! These tests drive the public API end to end: loading k-mers from
//! sequences, concurrent updates, growth, regeneration and dumping.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Barrier;

use ahash::AHashMap;
use kmertable_lib::constants::{NO_OWNER, NOT_PRESENT, PROBE_WINDOW};
use kmertable_lib::{
    encode_kmer, parse_dump, Counter, DumpFormat, DumpRecord, HashArray, KmerIterator, KmerTable,
    Location, ShardSet, TableConfig, TableShard, ValueSet,
};
use parking_lot::Mutex;

fn config(k: usize, ways: usize, initial_size: usize) -> TableConfig {
    TableConfig {
        k,
        ways,
        initial_size,
        threads: 4,
        ..TableConfig::default()
    }
}

/// xorshift64*, enough to scatter keys deterministically
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        self.0.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

#[test]
fn test_count_kmers_from_sequence() {
    let k = 5;
    let table = ShardSet::<Counter>::new(config(k, 3, 101)).unwrap();
    let sequence = b"ACGTACGTNACGTA";
    let keys: Vec<u64> = KmerIterator::new(sequence, k, false).collect();
    // Windows across the N are skipped: 4 before it, 1 after
    assert_eq!(keys.len(), 5);
    table.increment_all(&keys);

    assert_eq!(table.get_value(encode_kmer(b"ACGTA").unwrap()), Some(2));
    assert_eq!(table.get_value(encode_kmer(b"CGTAC").unwrap()), Some(1));
    assert_eq!(table.get_value(encode_kmer(b"TTTTT").unwrap()), None);
    assert_eq!(table.size(), 4);
}

#[test]
fn test_dump_round_trip_through_file() {
    let k = 11;
    let table = ShardSet::<Counter>::new(config(k, 5, 1009)).unwrap();
    let mut rng = Rng(0x9E37_79B9_7F4A_7C15);
    let mut expected = AHashMap::new();
    for _ in 0..3000 {
        let key = rng.next() & ((1 << (2 * k)) - 1);
        let count = (rng.next() % 50) as i32 + 1;
        table.set_value(key, count);
        expected.insert(key, count);
    }

    let file = tempfile::tempfile().unwrap();
    let sink = Mutex::new(file);
    let report = table.dump(&sink, &DumpFormat::text(k));
    assert!(report.success);
    assert_eq!(report.entries, expected.len());

    let mut file = sink.into_inner();
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut data = Vec::new();
    file.read_to_end(&mut data).unwrap();

    let records = parse_dump(&data, &DumpFormat::text(k)).unwrap();
    assert_eq!(records.len(), expected.len());
    let parsed: AHashMap<u64, i32> = records
        .into_iter()
        .map(|DumpRecord { key, values }| (key, values[0]))
        .collect();
    assert_eq!(parsed, expected);
}

#[test]
fn test_fasta_round_trip_with_value_sets() {
    let k = 7;
    let table = ShardSet::<ValueSet>::new(config(k, 2, 101)).unwrap();
    let a = encode_kmer(b"ACCGTTA").unwrap();
    let b = encode_kmer(b"GGGGCCC").unwrap();
    table.set_value(a, 4);
    table.set_value(a, 1);
    table.set_value(a, 4);
    table.set_values(b, &[7, NOT_PRESENT, 8]);

    let sink = Mutex::new(Vec::new());
    let format = DumpFormat::fasta(k);
    assert!(table.dump(&sink, &format).success);

    let mut records = parse_dump(&sink.into_inner(), &format).unwrap();
    records.sort_by_key(|r| r.key);
    let mut expected = vec![
        DumpRecord { key: a, values: vec![4, 1] },
        DumpRecord { key: b, values: vec![7] },
    ];
    expected.sort_by_key(|r| r.key);
    assert_eq!(records, expected);
}

#[test]
fn test_dump_filters_by_depth() {
    let table = ShardSet::<Counter>::new(config(4, 2, 101)).unwrap();
    for key in 0..20u64 {
        table.increment_by(key, key as u32);
    }
    let format = DumpFormat {
        min_count: 5,
        max_count: 9,
        numeric: true,
        ..DumpFormat::text(4)
    };
    let sink = Mutex::new(Vec::new());
    let report = table.dump(&sink, &format);
    assert_eq!(report.entries, 5);
    let records = parse_dump(&sink.into_inner(), &format).unwrap();
    assert!(records.iter().all(|r| (5..=9).contains(&r.values[0])));
}

#[test]
fn test_randomized_against_reference_model() {
    let table = ShardSet::<Counter>::new(config(31, 7, 31)).unwrap();
    let mut model: AHashMap<u64, i32> = AHashMap::new();
    let mut rng = Rng(42);

    for _ in 0..20_000 {
        // Narrow key range so keys repeat and collide
        let key = rng.next() % 5000;
        match rng.next() % 4 {
            0 | 1 => {
                let created = table.increment_and_report_created(key);
                assert_eq!(created, !model.contains_key(&key));
                *model.entry(key).or_insert(0) += 1;
            }
            2 => {
                let value = (rng.next() % 100) as i32;
                let created = table.set_if_absent(key, value);
                assert_eq!(created, !model.contains_key(&key));
                model.entry(key).or_insert(value);
            }
            _ => {
                assert_eq!(table.get_value(key), model.get(&key).copied());
            }
        }
    }

    assert_eq!(table.size(), model.len());
    for (&key, &count) in &model {
        assert_eq!(table.get_value(key), Some(count));
    }
    let hist = table.fill_histogram(1000);
    assert_eq!(hist.iter().sum::<u64>(), model.len() as u64);
}

#[test]
fn test_concurrent_load_is_exact() {
    let table = ShardSet::<Counter>::new(config(31, 4, 31)).unwrap();
    let threads = 6;
    let keys_per_thread = 4000u64;

    std::thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                for key in 0..keys_per_thread {
                    table.increment(key * 17 + 3);
                }
            });
        }
    });

    // Auto-resize ran many times while the threads raced
    assert!(table.capacity() > 4 * 31);
    assert_eq!(table.size(), keys_per_thread as usize);
    for key in 0..keys_per_thread {
        assert_eq!(table.get_value(key * 17 + 3), Some(threads));
    }
}

#[test]
fn test_racing_claims_highest_worker_wins() {
    let table = ShardSet::<Counter>::new(config(31, 3, 101)).unwrap();
    let keys: Vec<u64> = (0..300u64).map(|i| i * 7).collect();
    table.increment_all(&keys);
    table.initialize_ownership().unwrap();

    let (low, high) = (2, 9);
    let barrier = Barrier::new(2);
    let (table_ref, keys_ref, barrier_ref) = (&table, &keys, &barrier);
    let (low_results, high_results) = std::thread::scope(|s| {
        let claim_all = move |worker: i32| {
            s.spawn(move || {
                barrier_ref.wait();
                keys_ref
                    .iter()
                    .map(|&k| table_ref.claim(k, worker))
                    .collect::<Vec<_>>()
            })
        };
        let l = claim_all(low);
        let h = claim_all(high);
        (l.join().unwrap(), h.join().unwrap())
    });

    assert!(high_results.iter().all(|&owner| owner == high));
    for (i, &key) in keys.iter().enumerate() {
        assert_eq!(table.owner_of(key), high);
        // The low worker either won first and was overtaken, or saw the high owner
        assert!(low_results[i] == low || low_results[i] == high);
        assert!(!table.release(key, low));
        assert!(table.release(key, high));
        assert_eq!(table.owner_of(key), NO_OWNER);
    }
    table.clear_ownership();
}

#[test]
fn test_probe_window_overflow_and_resize_conservation() {
    let mut array = HashArray::<Counter>::new(211, true).unwrap();
    let capacity = array.capacity() as u64;
    let colliding: Vec<u64> = (0..=PROBE_WINDOW as u64).map(|i| 40 + i * capacity).collect();
    for &key in &colliding {
        array.increment(key);
    }
    assert_eq!(array.primary_size(), PROBE_WINDOW);
    assert_eq!(array.victim_size(), 1);
    assert_eq!(array.locate(colliding[PROBE_WINDOW]), Some(Location::Overflow));

    for key in 1000..1400u64 {
        array.increment(key);
    }
    let before = array.primary_size() + array.victim_size();
    assert!(array.over_limit());
    assert!(array.resize().unwrap());
    assert_eq!(array.primary_size() + array.victim_size(), before);
    for &key in &colliding {
        assert_eq!(array.get_value(key), Some(1));
    }
}

#[test]
fn test_regenerate_drops_low_depth_kmers() {
    let shard = TableShard::<Counter>::new(101, true, true).unwrap();
    let kmers: [(&[u8], u32); 4] = [(b"AAAC", 1), (b"AACA", 2), (b"ACAA", 5), (b"CAAA", 10)];
    for (kmer, count) in kmers {
        shard.increment_by(encode_kmer(kmer).unwrap(), count);
    }
    assert_eq!(shard.regenerate(3).unwrap(), 2);
    assert_eq!(shard.size(), 2);
    assert_eq!(shard.get_value(encode_kmer(b"ACAA").unwrap()), Some(5));
    assert_eq!(shard.get_value(encode_kmer(b"CAAA").unwrap()), Some(10));
    assert!(!shard.contains(encode_kmer(b"AAAC").unwrap()));
}

#[test]
fn test_counter_saturates_at_max() {
    let table = TableShard::<Counter>::new(101, false, false).unwrap();
    let key = encode_kmer(b"GATTACA").unwrap();
    // Equivalent to 2^31 + 10 single increments
    table.increment_by(key, i32::MAX as u32 - 5);
    let mut last = 0;
    for _ in 0..15 {
        let count = table.increment(key);
        assert!(count >= last);
        last = count;
    }
    assert_eq!(table.get_value(key), Some(i32::MAX));
}
