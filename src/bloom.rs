//! Bloom filter for skipping tables that cannot contain a key.
//!
//! False positives are possible, false negatives are not. Each table
//! carries one filter over all of its keys, sized from the expected key
//! count and the configured false-positive target:
//!
//! - bits:   m = -(n * ln p) / (ln 2)^2
//! - hashes: k = (m / n) * ln 2
//!
//! Membership uses double hashing: two independent 64-bit FNV-1a values
//! combined as `h1 + i * h2` for each of the k probes. The hash must be
//! stable across processes because the filter is persisted with the
//! table, so no randomly-seeded hasher is used.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(data: &[u8], seed: u64) -> u64 {
    let mut hash = FNV_OFFSET ^ seed;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    nbits: u64,
    nhashes: u32,
}

impl BloomFilter {
    /// Creates an empty filter sized for `expected_items` keys at the
    /// given false-positive rate.
    pub fn new(expected_items: usize, fp_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = fp_rate.clamp(1e-6, 0.5);

        let nbits = (-(n * p.ln()) / (2f64.ln() * 2f64.ln())).ceil().max(8.0) as u64;
        let nhashes = ((nbits as f64 / n) * 2f64.ln()).round().max(1.0) as u32;

        Self {
            bits: vec![0u8; (nbits as usize + 7) / 8],
            nbits,
            nhashes,
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = self.hash_pair(key);
        for i in 0..self.nhashes {
            let bit = self.probe(h1, h2, i);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Returns false only when the key is definitely absent.
    pub fn contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = self.hash_pair(key);
        for i in 0..self.nhashes {
            let bit = self.probe(h1, h2, i);
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn nbits(&self) -> u64 {
        self.nbits
    }

    pub fn nhashes(&self) -> u32 {
        self.nhashes
    }

    fn hash_pair(&self, key: &[u8]) -> (u64, u64) {
        (fnv1a(key, 0), fnv1a(key, 0x9e37_79b9_7f4a_7c15))
    }

    fn probe(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % self.nbits
    }

    /// Serializes the filter as `[nbits: u64][nhashes: u32][bit bytes]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.bits.len());
        buf.write_u64::<LittleEndian>(self.nbits).unwrap();
        buf.write_u32::<LittleEndian>(self.nhashes).unwrap();
        buf.extend_from_slice(&self.bits);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let nbits = cursor.read_u64::<LittleEndian>()?;
        let nhashes = cursor.read_u32::<LittleEndian>()?;

        let expected_bytes = (nbits as usize + 7) / 8;
        let bits = data[12..].to_vec();
        if nbits == 0 || nhashes == 0 || bits.len() != expected_bytes {
            return Err(Error::Corruption(format!(
                "bloom filter block inconsistent: {} bits, {} hashes, {} bytes",
                nbits,
                nhashes,
                bits.len()
            )));
        }

        Ok(Self {
            bits,
            nbits,
            nhashes,
        })
    }
}
