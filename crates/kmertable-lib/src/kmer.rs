//! K-mer key arithmetic and rolling extraction
//!
//! Keys are `u64` values holding up to 31 bases (see [`crate::encoding`]).
//! This module supplies the strand operations the tables are keyed by and
//! an iterator that walks a sequence producing one key per valid k-mer.

use crate::constants::MAX_K;
use crate::encoding::encode_base;

/// Mask covering the low `2k` bits of a key
#[inline]
pub const fn kmer_mask(k: usize) -> u64 {
    if k >= 32 {
        u64::MAX
    } else {
        (1u64 << (2 * k)) - 1
    }
}

/// Reverse complement of a packed k-mer
///
/// Uses bit-parallel operations: complement via NOT, then reverse 2-bit pairs.
#[inline]
pub const fn reverse_complement(key: u64, k: usize) -> u64 {
    let mut x = !key;
    // Swap adjacent 2-bit pairs
    x = ((x >> 2) & 0x3333_3333_3333_3333) | ((x & 0x3333_3333_3333_3333) << 2);
    // Swap adjacent nibbles
    x = ((x >> 4) & 0x0F0F_0F0F_0F0F_0F0F) | ((x & 0x0F0F_0F0F_0F0F_0F0F) << 4);
    x = x.swap_bytes();
    // Drop the padding that the reversal moved into the low bits
    x >> (64 - 2 * k)
}

/// Canonical form: the larger of the forward and reverse-complement keys
#[inline]
pub const fn canonical(key: u64, k: usize) -> u64 {
    let rc = reverse_complement(key, k);
    if rc > key {
        rc
    } else {
        key
    }
}

/// Number of C or G bases in a packed k-mer
///
/// Unused high pairs decode as A and never contribute.
#[inline]
pub const fn gc_count(key: u64) -> u32 {
    // C = 01, G = 10: exactly one bit of the pair is set
    let pairs = (key ^ (key >> 1)) & 0x5555_5555_5555_5555;
    pairs.count_ones()
}

/// Rolling iterator over the k-mer keys of a sequence
///
/// Any byte that is not A/C/G/T restarts the window, so k-mers spanning an
/// `N` are skipped.
pub struct KmerIterator<'a> {
    sequence: &'a [u8],
    pos: usize,
    k: usize,
    canonical: bool,
    mask: u64,
    forward: u64,
    reverse: u64,
    valid: usize,
}

impl<'a> KmerIterator<'a> {
    /// Create an iterator over `sequence` producing `k`-mers
    ///
    /// # Panics
    /// Panics if `k` is zero or larger than [`MAX_K`].
    pub fn new(sequence: &'a [u8], k: usize, canonical: bool) -> Self {
        assert!(k > 0 && k <= MAX_K, "k must be in [1, {}], got {}", MAX_K, k);
        Self {
            sequence,
            pos: 0,
            k,
            canonical,
            mask: kmer_mask(k),
            forward: 0,
            reverse: 0,
            valid: 0,
        }
    }
}

impl Iterator for KmerIterator<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let shift = 2 * (self.k - 1);
        while self.pos < self.sequence.len() {
            let base = self.sequence[self.pos];
            self.pos += 1;
            match encode_base(base) {
                Ok(code) => {
                    let code = code as u64;
                    self.forward = ((self.forward << 2) | code) & self.mask;
                    self.reverse = (self.reverse >> 2) | ((3 - code) << shift);
                    self.valid += 1;
                    if self.valid >= self.k {
                        return Some(if self.canonical {
                            self.forward.max(self.reverse)
                        } else {
                            self.forward
                        });
                    }
                }
                Err(_) => {
                    self.valid = 0;
                    self.forward = 0;
                    self.reverse = 0;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode_kmer, encode_kmer};

    #[test]
    fn test_reverse_complement() {
        let key = encode_kmer(b"ACGTG").unwrap();
        assert_eq!(decode_kmer(reverse_complement(key, 5), 5), "CACGT");

        let key = encode_kmer(b"ACGTACG").unwrap();
        assert_eq!(decode_kmer(reverse_complement(key, 7), 7), "CGTACGT");

        let key = encode_kmer(b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAC").unwrap();
        assert_eq!(
            decode_kmer(reverse_complement(key, 31), 31),
            "GTTTTTTTTTTTTTTTTTTTTTTTTTTTTTT"
        );
    }

    #[test]
    fn test_reverse_complement_involution() {
        let key = encode_kmer(b"GATTACAGATTACA").unwrap();
        assert_eq!(reverse_complement(reverse_complement(key, 14), 14), key);
    }

    #[test]
    fn test_canonical_is_strand_max() {
        let fwd = encode_kmer(b"AAAC").unwrap();
        let rc = encode_kmer(b"GTTT").unwrap();
        assert_eq!(canonical(fwd, 4), rc);
        assert_eq!(canonical(rc, 4), rc);
    }

    #[test]
    fn test_gc_count() {
        assert_eq!(gc_count(encode_kmer(b"AAAA").unwrap()), 0);
        assert_eq!(gc_count(encode_kmer(b"TTTT").unwrap()), 0);
        assert_eq!(gc_count(encode_kmer(b"GCGC").unwrap()), 4);
        assert_eq!(gc_count(encode_kmer(b"ACGT").unwrap()), 2);
    }

    #[test]
    fn test_kmer_iterator_forward() {
        let keys: Vec<u64> = KmerIterator::new(b"ACGTA", 3, false).collect();
        let expected: Vec<u64> = ["ACG", "CGT", "GTA"]
            .iter()
            .map(|s| encode_kmer(s.as_bytes()).unwrap())
            .collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_kmer_iterator_skips_invalid() {
        let keys: Vec<u64> = KmerIterator::new(b"ACGNACGT", 3, false).collect();
        let expected: Vec<u64> = ["ACG", "ACG", "CGT"]
            .iter()
            .map(|s| encode_kmer(s.as_bytes()).unwrap())
            .collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_kmer_iterator_canonical() {
        let seq = b"GATTACAGGT";
        for key in KmerIterator::new(seq, 5, true) {
            assert_eq!(key, canonical(key, 5));
        }
        let forward: Vec<u64> = KmerIterator::new(seq, 5, false).collect();
        let canon: Vec<u64> = KmerIterator::new(seq, 5, true).collect();
        for (f, c) in forward.iter().zip(&canon) {
            assert_eq!(canonical(*f, 5), *c);
        }
    }

    #[test]
    fn test_kmer_iterator_short_sequence() {
        assert_eq!(KmerIterator::new(b"AC", 3, false).count(), 0);
        assert_eq!(KmerIterator::new(b"ACG", 3, false).count(), 1);
    }
}
