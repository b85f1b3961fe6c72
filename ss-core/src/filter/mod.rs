#![forbid(unsafe_code)]

//! The salt replay filter (C3): a ring of bloom filters giving
//! at-most-once-ish acceptance of session salts under bounded memory.
//!
//! Mirrors the lock discipline `nyx-stream::replay_protection` uses for its
//! anti-replay window (a single `tokio::sync::RwLock` guarding mutable
//! state, `add`/`contains` as the two operations), though the underlying
//! data structure here is a bloom-filter ring rather than a sliding bitmap
//! window, per spec §4.3/§9.

mod bloom;

use tokio::sync::RwLock;

use bloom::Bloom;

const NUM_SLOTS: usize = 10;
const TOTAL_CAPACITY: usize = 1_000_000;
const FALSE_POSITIVE_RATE: f64 = 1e-6;

struct Inner {
    slots: Vec<Bloom>,
    active: usize,
    count: usize,
    slot_capacity: usize,
}

/// Time-windowed, probabilistic replay filter shared by the TCP and UDP
/// relays. One instance per server; outlives every connection.
pub struct SaltFilter {
    inner: RwLock<Inner>,
}

impl SaltFilter {
    pub fn new() -> Self {
        Self::with_capacity(TOTAL_CAPACITY, FALSE_POSITIVE_RATE)
    }

    pub fn with_capacity(total_capacity: usize, fp_rate: f64) -> Self {
        let slot_capacity = (total_capacity / NUM_SLOTS).max(1);
        let slots = (0..NUM_SLOTS)
            .map(|_| Bloom::new(slot_capacity, fp_rate))
            .collect();
        Self {
            inner: RwLock::new(Inner {
                slots,
                active: 0,
                count: 0,
                slot_capacity,
            }),
        }
    }

    /// Insert `salt` into the active slot. If the active slot's insertion
    /// count has exceeded its capacity, advance the ring first and clear
    /// the newly-active slot. The insertion counter is per-ring, not
    /// per-slot, by design (spec §9): this yields a sliding window roughly
    /// equal to total capacity at the cost of imprecise per-slot
    /// occupancy.
    pub async fn add(&self, salt: &[u8]) {
        let mut inner = self.inner.write().await;
        if inner.count > inner.slot_capacity {
            inner.active = (inner.active + 1) % NUM_SLOTS;
            let active = inner.active;
            inner.slots[active].clear();
            inner.count = 0;
        }
        inner.count += 1;
        let active = inner.active;
        inner.slots[active].insert(salt);
    }

    /// True if any slot in the ring reports `salt` present.
    pub async fn contains(&self, salt: &[u8]) -> bool {
        let inner = self.inner.read().await;
        inner.slots.iter().any(|slot| slot.contains(salt))
    }
}

impl Default for SaltFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn contains_immediately_after_add() {
        let filter = SaltFilter::with_capacity(1000, 1e-6);
        let salt = vec![1u8; 16];
        filter.add(&salt).await;
        assert!(filter.contains(&salt).await);
    }

    #[tokio::test]
    async fn unseen_salt_is_absent() {
        let filter = SaltFilter::with_capacity(1000, 1e-6);
        assert!(!filter.contains(&[9u8; 16]).await);
    }

    #[tokio::test]
    async fn remembers_at_least_one_full_window_of_capacity() {
        // capacity=100 -> slot_capacity=10. Insert one salt, then fill
        // close to a full window's worth of *other* salts; the first salt
        // must still be remembered somewhere in the ring.
        let filter = SaltFilter::with_capacity(100, 1e-6);
        let first = vec![0xABu8; 16];
        filter.add(&first).await;
        for i in 0..90u32 {
            filter.add(&i.to_le_bytes()).await;
        }
        assert!(filter.contains(&first).await);
    }

    #[tokio::test]
    async fn ring_eventually_forgets_past_many_windows() {
        let filter = SaltFilter::with_capacity(100, 1e-6);
        let first = vec![0xCDu8; 16];
        filter.add(&first).await;
        // Drive far past the full ring capacity (10 slots * slot_capacity)
        // so the ring wraps several times over.
        for i in 0..5000u32 {
            filter.add(&i.to_le_bytes()).await;
        }
        assert!(!filter.contains(&first).await);
    }
}
