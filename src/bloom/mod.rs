//! Bloom filter sidecar for SSTables.
//!
//! A bit array with `k` probe positions per key, derived by double hashing
//! two independent 64-bit FNV-1a hashes: `h(i) = h1 + i·h2`. The filter can
//! say a key is *definitely absent* (no false negatives) but only *maybe
//! present* otherwise; the false-positive rate is tuned by sizing.
//!
//! Sizing for `n` expected keys at target rate `p`:
//!
//! ```text
//! m = ceil(-n·ln(p) / (ln 2)²)      bits
//! k = round((m/n)·ln 2)             hash functions
//! ```
//!
//! # Wire format
//!
//! ```text
//! [m: u64 LE][k: u8][bits: ceil(m/8) bytes]
//! ```
//!
//! Each SSTable stores its filter in a sibling `.bloom` file; a point
//! lookup consults the filter before touching the table at all.


use thiserror::Error;

/// Decoding cap: a filter may not exceed 128 MiB of bits.
const MAX_BLOOM_BYTES: usize = 128 * 1024 * 1024;

/// Errors returned when decoding a serialized filter.
#[derive(Debug, Error)]
pub enum BloomError {
    /// The serialized form was shorter than its declared size.
    #[error("truncated bloom filter (need {needed} bytes, have {available})")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// Declared bit count exceeds the safety cap, or is zero.
    #[error("invalid bloom filter geometry: m={m}, k={k}")]
    InvalidGeometry {
        /// Declared bit count.
        m: u64,
        /// Declared hash count.
        k: u8,
    },
}

/// A bloom filter over byte-string keys.
#[derive(Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u8,
}

impl BloomFilter {
    /// Creates a filter sized for `expected_keys` at the given target
    /// false-positive rate.
    ///
    /// `expected_keys` of zero is clamped to one so an empty flush still
    /// produces a well-formed (tiny) filter.
    pub fn with_rate(expected_keys: usize, fp_rate: f64) -> Self {
        let n = expected_keys.max(1) as f64;
        let p = fp_rate.clamp(1e-9, 0.5);

        let m = (-n * p.ln() / (std::f64::consts::LN_2 * std::f64::consts::LN_2)).ceil();
        let m = (m as u64).max(8);

        let k = ((m as f64 / n) * std::f64::consts::LN_2).round();
        let k = (k as u8).max(1);

        Self {
            bits: vec![0u8; m.div_ceil(8) as usize],
            num_bits: m,
            num_hashes: k,
        }
    }

    /// Inserts a key. After this call, [`contains`](Self::contains) for the
    /// same key always returns true.
    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = probe(h1, h2, i, self.num_bits);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Returns `false` only when the key was never added.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = probe(h1, h2, i, self.num_bits);
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Number of bits (`m`).
    #[must_use]
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Number of hash functions (`k`).
    #[must_use]
    pub fn num_hashes(&self) -> u8 {
        self.num_hashes
    }

    /// Serializes as `[m: u64 LE][k: u8][bits]`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.bits.len());
        out.extend_from_slice(&self.num_bits.to_le_bytes());
        out.push(self.num_hashes);
        out.extend_from_slice(&self.bits);
        out
    }

    /// Deserializes the `[m][k][bits]` form produced by
    /// [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(buf: &[u8]) -> Result<Self, BloomError> {
        if buf.len() < 9 {
            return Err(BloomError::Truncated {
                needed: 9,
                available: buf.len(),
            });
        }
        let mut m_bytes = [0u8; 8];
        m_bytes.copy_from_slice(&buf[..8]);
        let num_bits = u64::from_le_bytes(m_bytes);
        let num_hashes = buf[8];

        let byte_len = num_bits.div_ceil(8) as usize;
        if num_bits == 0 || num_hashes == 0 || byte_len > MAX_BLOOM_BYTES {
            return Err(BloomError::InvalidGeometry {
                m: num_bits,
                k: num_hashes,
            });
        }
        if buf.len() < 9 + byte_len {
            return Err(BloomError::Truncated {
                needed: 9 + byte_len,
                available: buf.len(),
            });
        }

        Ok(Self {
            bits: buf[9..9 + byte_len].to_vec(),
            num_bits,
            num_hashes,
        })
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .finish()
    }
}

/// Two independent 64-bit hashes: FNV-1a from two offset bases.
fn hash_pair(key: &[u8]) -> (u64, u64) {
    (
        fnv1a_64(key, 0xcbf2_9ce4_8422_2325),
        fnv1a_64(key, 0x517c_c1b7_2722_0a95),
    )
}

/// Double hashing: probe `i` lands at `(h1 + i·h2) mod m`.
#[inline]
fn probe(h1: u64, h2: u64, i: u8, num_bits: u64) -> u64 {
    h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits
}

fn fnv1a_64(data: &[u8], basis: u64) -> u64 {
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = basis;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
