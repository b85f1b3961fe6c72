//! UDP NAT table (C6): maps a client's `(peer_addr)` identity to the
//! upstream socket handling its traffic, with a generation counter to
//! resolve the insert/teardown race noted in the original spec's open
//! questions: a pump task tearing itself down must not remove a newer
//! entry that has already replaced it for the same key.
//!
//! Idle expiry is owned entirely by each entry's own pump task (its read
//! loop times out after `udp_idle_secs` of silence from the upstream
//! target); this table has no periodic sweep of its own, since a sweep
//! keyed on a separate activity clock would tear down an entry that is
//! still receiving upstream traffic just because the client fell silent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub struct NatEntry {
    pub generation: u64,
    pub cancel: CancellationToken,
    pub upstream: Arc<UdpSocket>,
}

pub struct NatTable {
    entries: Mutex<HashMap<SocketAddr, NatEntry>>,
    next_generation: std::sync::atomic::AtomicU64,
}

impl NatTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: std::sync::atomic::AtomicU64::new(1),
        })
    }

    /// Look up the entry for `peer`, if any.
    pub async fn touch(&self, peer: SocketAddr) -> Option<u64> {
        let entries = self.entries.lock().await;
        entries.get(&peer).map(|e| e.generation)
    }

    /// Register a brand-new entry for `peer`, returning its generation
    /// number. Any previous entry under the same key is replaced; the
    /// caller is responsible for cancelling the old pump task.
    pub async fn insert(&self, peer: SocketAddr, upstream: Arc<UdpSocket>) -> (u64, CancellationToken) {
        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let mut entries = self.entries.lock().await;
        entries.insert(
            peer,
            NatEntry {
                generation,
                cancel: cancel.clone(),
                upstream,
            },
        );
        (generation, cancel)
    }

    /// Look up the upstream socket for `peer` if an entry already exists.
    /// The caller binds a new socket and calls `insert` on a miss; binding
    /// happens outside this lock so the lock is never held across an await.
    pub async fn lookup(&self, peer: SocketAddr) -> Option<Arc<UdpSocket>> {
        let entries = self.entries.lock().await;
        entries.get(&peer).map(|e| e.upstream.clone())
    }

    /// Remove the entry for `peer`, but only if it is still the same
    /// generation the caller was assigned. A pump task that lost a race
    /// against a fresher insert must not delete the entry that replaced it.
    pub async fn remove_if_current(&self, peer: SocketAddr, generation: u64) {
        let mut entries = self.entries.lock().await;
        if let std::collections::hash_map::Entry::Occupied(occ) = entries.entry(peer) {
            if occ.get().generation == generation {
                occ.remove();
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn unbound_upstream() -> Arc<UdpSocket> {
        Arc::new(
            UdpSocket::bind((std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 0))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn insert_then_touch_returns_generation() {
        let table = NatTable::new();
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let (gen1, _cancel) = table.insert(peer, unbound_upstream().await).await;
        assert_eq!(table.touch(peer).await, Some(gen1));
    }

    #[tokio::test]
    async fn lookup_returns_the_same_upstream_socket() {
        let table = NatTable::new();
        let peer: SocketAddr = "127.0.0.1:9004".parse().unwrap();
        let socket = unbound_upstream().await;
        let expected_addr = socket.local_addr().unwrap();
        table.insert(peer, socket).await;
        let found = table.lookup(peer).await.unwrap();
        assert_eq!(found.local_addr().unwrap(), expected_addr);
    }

    #[tokio::test]
    async fn stale_generation_does_not_remove_fresh_entry() {
        let table = NatTable::new();
        let peer: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let (gen1, _c1) = table.insert(peer, unbound_upstream().await).await;
        let (gen2, _c2) = table.insert(peer, unbound_upstream().await).await;
        assert_ne!(gen1, gen2);

        // A pump task holding the stale generation loses the race.
        table.remove_if_current(peer, gen1).await;
        assert_eq!(table.len().await, 1);
        assert_eq!(table.touch(peer).await, Some(gen2));
    }

    #[tokio::test]
    async fn current_generation_removes_entry() {
        let table = NatTable::new();
        let peer: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        let (gen1, _cancel) = table.insert(peer, unbound_upstream().await).await;
        table.remove_if_current(peer, gen1).await;
        assert_eq!(table.len().await, 0);
    }
}
