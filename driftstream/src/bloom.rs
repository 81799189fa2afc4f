//! Counting Bloom filter with 4-bit saturating counters.

use drifttrust::crypto::hash::sha1;

/// Counter positions derived per key.
pub const HASH_COUNT: usize = 5;

/// Largest value a counter holds. A saturated counter is never
/// decremented.
pub const MAX_COUNT: u8 = 15;

#[derive(Debug, Clone)]
pub struct CountingBloomFilter {
    /// Two counters per byte, low nibble first.
    counters: Vec<u8>,
    size: usize,
    entries: usize,
}

impl CountingBloomFilter {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            counters: vec![0; size.div_ceil(2)],
            size,
            entries: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Keys added and not removed.
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    fn indices(&self, key: &[u8]) -> [usize; HASH_COUNT] {
        let digest = sha1(&[key]);
        let mut out = [0usize; HASH_COUNT];
        for (i, slot) in out.iter_mut().enumerate() {
            let b = &digest[i * 4..i * 4 + 4];
            *slot = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize % self.size;
        }
        out
    }

    fn get(&self, index: usize) -> u8 {
        let byte = self.counters[index / 2];
        if index % 2 == 0 {
            byte & 0x0f
        } else {
            byte >> 4
        }
    }

    fn set(&mut self, index: usize, value: u8) {
        let byte = &mut self.counters[index / 2];
        if index % 2 == 0 {
            *byte = (*byte & 0xf0) | (value & 0x0f);
        } else {
            *byte = (*byte & 0x0f) | (value << 4);
        }
    }

    /// Add `key` and return its count afterwards (the smallest of its
    /// counters).
    pub fn add(&mut self, key: &[u8]) -> u8 {
        let mut min = MAX_COUNT;
        for index in self.indices(key) {
            let value = (self.get(index) + 1).min(MAX_COUNT);
            self.set(index, value);
            min = min.min(value);
        }
        self.entries += 1;
        min
    }

    /// Remove one occurrence of `key` and return its count afterwards.
    pub fn remove(&mut self, key: &[u8]) -> u8 {
        let mut min = MAX_COUNT;
        for index in self.indices(key) {
            let value = match self.get(index) {
                0 => 0,
                MAX_COUNT => MAX_COUNT,
                v => v - 1,
            };
            self.set(index, value);
            min = min.min(value);
        }
        self.entries = self.entries.saturating_sub(1);
        min
    }

    /// Estimated number of times `key` was added.
    pub fn count(&self, key: &[u8]) -> u8 {
        self.indices(key)
            .into_iter()
            .map(|i| self.get(i))
            .min()
            .unwrap_or(0)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.count(key) > 0
    }
}
