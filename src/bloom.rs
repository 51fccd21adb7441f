//! Probabilistic seen-set of deployed entity ids
//!
//! A hit means "maybe deployed" and must be confirmed against the database;
//! a miss is definitive. Entity ids are inserted only after the deployment is
//! durably committed, so a miss never hides a stored entity.

use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    items: u64,
}

impl BloomFilter {
    /// Size the filter for `expected_items` at the given false positive rate
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().clamp(1.0, 32.0) as u32;
        let words = num_bits.div_ceil(64) as usize;

        Self {
            bits: vec![0; words],
            num_bits,
            num_hashes,
            items: 0,
        }
    }

    pub fn add(&mut self, item: &str) {
        for index in self.indexes(item) {
            self.bits[(index / 64) as usize] |= 1 << (index % 64);
        }
        self.items += 1;
    }

    /// True when the item may have been added
    pub fn check(&self, item: &str) -> bool {
        self.indexes(item)
            .all(|index| self.bits[(index / 64) as usize] & (1 << (index % 64)) != 0)
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
        self.items = 0;
    }

    /// Number of insertions (not distinct items)
    pub fn len(&self) -> u64 {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    /// Double hashing over two halves of a SHA-256 digest
    fn indexes(&self, item: &str) -> impl Iterator<Item = u64> {
        let digest = Sha256::digest(item.as_bytes());
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&digest[0..8]);
        b.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(a);
        let h2 = u64::from_le_bytes(b) | 1;
        let num_bits = self.num_bits;
        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
    }
}
