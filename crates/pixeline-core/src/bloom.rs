//! Process-local probabilistic URL membership filter
//!
//! Bit array sized at construction from an expected item count and a target
//! false-positive rate. No removal, no persistence: every process starts
//! with an empty filter and falls back on the shared state store for
//! authority. False positives only ever skip a download, never repeat one.

use std::sync::Mutex;

/// Fixed-capacity bloom filter over string keys.
///
/// Probe positions come from two 64-bit halves of a blake3 digest combined
/// with double hashing (`h1 + i * h2`).
#[derive(Debug)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    items: usize,
}

impl BloomFilter {
    /// Size the filter for `expected_items` at `false_positive_rate`.
    ///
    /// `m = -n ln p / (ln 2)^2`, `k = m/n ln 2`, both clamped to at least 1.
    pub fn with_rate(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(f64::MIN_POSITIVE, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let num_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().max(1.0) as u32;
        let words = num_bits.div_ceil(64) as usize;

        Self {
            bits: vec![0; words],
            num_bits,
            num_hashes,
            items: 0,
        }
    }

    fn probes(&self, key: &str) -> impl Iterator<Item = u64> + '_ {
        let digest = blake3::hash(key.as_bytes());
        let bytes = digest.as_bytes();
        let h1 = u64::from_le_bytes(bytes[0..8].try_into().unwrap_or_default());
        // odd step so probes never collapse onto a single bit
        let h2 = u64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default()) | 1;
        (0..u64::from(self.num_hashes))
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }

    pub fn insert(&mut self, key: &str) {
        let positions: Vec<u64> = self.probes(key).collect();
        for bit in positions {
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.items += 1;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.probes(key)
            .all(|bit| self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    /// Number of `insert` calls (duplicates included)
    pub fn len(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }
}

/// Thread-safe wrapper shared by all consumer tasks of one process.
#[derive(Debug)]
pub struct MembershipFilter {
    inner: Mutex<BloomFilter>,
}

impl MembershipFilter {
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let bloom = BloomFilter::with_rate(expected_items, false_positive_rate);
        log::debug!(
            "Membership filter: {} bits ({} KiB), {} hashes",
            bloom.num_bits(),
            bloom.num_bits() / 8 / 1024,
            bloom.num_hashes()
        );
        Self {
            inner: Mutex::new(bloom),
        }
    }

    /// "Possibly present" (true) or "definitely absent" (false)
    pub fn contains(&self, url: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(url)
    }

    pub fn insert(&self, url: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url);
    }

    /// Insert and report whether the key was possibly present before,
    /// as one step under the lock.
    pub fn check_and_insert(&self, url: &str) -> bool {
        let mut bloom = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let present = bloom.contains(url);
        if !present {
            bloom.insert(url);
        }
        present
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
