//! Prime sizing for primary arrays and overflow roots
//!
//! Capacities are prime so that `key % capacity` spreads structured,
//! low-entropy k-mer keys across the whole array.

/// Deterministic primality test for the table size range (trial division by 6k±1)
pub fn is_prime(n: u64) -> bool {
    if n < 4 {
        return n >= 2;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let mut d = 5u64;
    while d * d <= n {
        if n % d == 0 || n % (d + 2) == 0 {
            return false;
        }
        d += 6;
    }
    true
}

/// Smallest prime `>= n`
pub fn prime_at_least(n: u64) -> u64 {
    let mut candidate = n.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}

/// Largest prime `<= n`, or 2 when there is none
pub fn prime_at_most(n: u64) -> u64 {
    let mut candidate = n;
    while candidate > 2 && !is_prime(candidate) {
        candidate -= 1;
    }
    candidate.max(2)
}
