//! DNA nucleotide encoding for table keys
//!
//! Keys are k-mers packed two bits per base, first base in the most
//! significant pair:
//! - A (65/97)  -> 00
//! - C (67/99)  -> 01
//! - G (71/103) -> 10
//! - T (84/116) -> 11
//!
//! With this code the complement of a base is `3 - code`.

use thiserror::Error;

use crate::constants::MAX_K;

/// Error type for encoding operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// The input byte is not a valid DNA base (A/C/G/T)
    #[error("Invalid DNA base: {0:?}")]
    InvalidBase(u8),
    /// The input string is not a valid k-mer
    #[error("Invalid k-mer string: {0}")]
    InvalidKmer(String),
    /// The k-mer is longer than a single key can hold
    #[error("K-mer too long: {0} bases (maximum {max})", max = MAX_K)]
    TooLong(usize),
}

const BASES: [u8; 4] = [b'A', b'C', b'G', b'T'];

/// Encode a single DNA nucleotide to 2 bits
#[inline]
pub const fn encode_base(base: u8) -> Result<u8, EncodingError> {
    match base {
        b'A' | b'a' => Ok(0),
        b'C' | b'c' => Ok(1),
        b'G' | b'g' => Ok(2),
        b'T' | b't' => Ok(3),
        _ => Err(EncodingError::InvalidBase(base)),
    }
}

/// Decode a 2-bit value to DNA nucleotide (uppercase)
#[inline]
pub const fn decode_base(bits: u8) -> u8 {
    BASES[(bits & 0b11) as usize]
}

/// Get the complement of a DNA base (encoded)
#[inline]
pub const fn complement_base(bits: u8) -> u8 {
    3 - (bits & 0b11)
}

/// Pack a k-mer string into a key
///
/// # Errors
/// Returns an error if the sequence is longer than [`MAX_K`] or contains
/// a non-ACGT byte.
pub fn encode_kmer(sequence: &[u8]) -> Result<u64, EncodingError> {
    if sequence.len() > MAX_K {
        return Err(EncodingError::TooLong(sequence.len()));
    }
    let mut key = 0u64;
    for (i, &base) in sequence.iter().enumerate() {
        let code = encode_base(base).map_err(|_| {
            EncodingError::InvalidKmer(format!(
                "Invalid base at position {}: {:?}",
                i, base as char
            ))
        })?;
        key = (key << 2) | code as u64;
    }
    Ok(key)
}

/// Append the `k` bases of `key` to `out`
#[inline]
pub fn write_bases(key: u64, k: usize, out: &mut Vec<u8>) {
    for i in (0..k).rev() {
        out.push(decode_base((key >> (2 * i)) as u8));
    }
}

/// Decode a key back to its k-mer string
pub fn decode_kmer(key: u64, k: usize) -> String {
    let mut bytes = Vec::with_capacity(k);
    write_bases(key, k, &mut bytes);
    // Only ACGT is ever written
    bytes.into_iter().map(char::from).collect()
}
