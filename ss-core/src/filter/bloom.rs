#![forbid(unsafe_code)]

//! A plain bitset bloom filter using the FNV-1 / FNV-1a pair as the
//! `(h1, h2)` double-hash family (spec §9: "any equivalent double-hash
//! scheme yielding the same FPR is acceptable, but matches the source's
//! hash selection").

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in data {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= b as u64;
    }
    hash
}

fn fnv1a(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Standard bloom-filter sizing formulas: optimal bit count for a target
/// capacity and false-positive rate, and the matching number of hash
/// probes.
fn optimal_num_bits(capacity: usize, fp_rate: f64) -> u64 {
    if capacity == 0 {
        return 64;
    }
    let n = capacity as f64;
    let m = -(n * fp_rate.ln()) / std::f64::consts::LN_2.powi(2);
    (m.ceil() as u64).max(64)
}

fn optimal_num_hashes(num_bits: u64, capacity: usize) -> u32 {
    if capacity == 0 {
        return 1;
    }
    let k = (num_bits as f64 / capacity as f64) * std::f64::consts::LN_2;
    (k.round() as u32).clamp(1, 32)
}

/// Fixed-capacity bloom filter with double-hash bit probing
/// (`h1 + i*h2` for probe `i`).
pub struct Bloom {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl Bloom {
    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        let num_bits = optimal_num_bits(capacity, fp_rate);
        let num_hashes = optimal_num_hashes(num_bits, capacity);
        let words = num_bits.div_ceil(64) as usize;
        Self {
            bits: vec![0u64; words],
            num_bits,
            num_hashes,
        }
    }

    fn bit_index(&self, h1: u64, h2: u64, probe: u32) -> u64 {
        h1.wrapping_add((probe as u64).wrapping_mul(h2)) % self.num_bits
    }

    pub fn insert(&mut self, data: &[u8]) {
        let (h1, h2) = (fnv1(data), fnv1a(data));
        for probe in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, probe);
            self.bits[(idx / 64) as usize] |= 1u64 << (idx % 64);
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        let (h1, h2) = (fnv1(data), fnv1a(data));
        (0..self.num_hashes).all(|probe| {
            let idx = self.bit_index(h1, h2, probe);
            self.bits[(idx / 64) as usize] & (1u64 << (idx % 64)) != 0
        })
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_immediately_after_insert() {
        let mut b = Bloom::new(1000, 1e-6);
        b.insert(b"salt-one");
        assert!(b.contains(b"salt-one"));
    }

    #[test]
    fn clear_forgets_entries() {
        let mut b = Bloom::new(1000, 1e-6);
        b.insert(b"salt-one");
        b.clear();
        assert!(!b.contains(b"salt-one"));
    }

    #[test]
    fn false_positive_rate_is_low_in_practice() {
        let mut b = Bloom::new(10_000, 1e-6);
        for i in 0..10_000u32 {
            b.insert(&i.to_le_bytes());
        }
        let mut false_positives = 0;
        for i in 10_000..20_000u32 {
            if b.contains(&i.to_le_bytes()) {
                false_positives += 1;
            }
        }
        // Generous bound: well above the target FPR but catches gross
        // regressions (e.g. a broken hash family returning all zero bits).
        assert!(false_positives < 50, "false_positives={false_positives}");
    }
}
