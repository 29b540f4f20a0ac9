//! Client registry.
//!
//! Read-mostly map from client id to record: every mixer tick snapshots
//! it, joins and leaves are rare. Ids are allocated monotonically and
//! never reused for the lifetime of the process.

use super::client::{ClientId, ClientRecord};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub struct Registry {
    clients: RwLock<HashMap<ClientId, Arc<ClientRecord>>>,
    next_id: AtomicU32,
}

impl Registry {
    pub fn new() -> Self {
        Registry { clients: RwLock::new(HashMap::new()), next_id: AtomicU32::new(1) }
    }

    /// Hand out the next client id. Monotonic; ids of departed clients
    /// are never reissued.
    pub fn allocate_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, record: Arc<ClientRecord>) {
        self.clients.write().insert(record.id, record);
    }

    pub fn remove(&self, id: ClientId) -> Option<Arc<ClientRecord>> {
        self.clients.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Clone the current membership, ordered by join time so mixer tile
    /// assignment stays stable. The read lock is held only for the
    /// copy, never across I/O.
    pub fn snapshot(&self) -> Vec<Arc<ClientRecord>> {
        let mut records: Vec<Arc<ClientRecord>> =
            self.clients.read().values().cloned().collect();
        records.sort_by_key(|record| (record.joined_at, record.id));
        records
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher::SealingStream;
    use crate::crypto::Identity;
    use crate::mixer::ColorMode;
    use crate::server::client::ViewState;
    use crate::transport::{queue::SendQueue, Session, TransportKind};
    use tokio::sync::mpsc;

    pub(crate) fn test_session() -> Session {
        let queue = Arc::new(SendQueue::new(1 << 20, 768 << 10, 512 << 10));
        let (tx, _rx) = mpsc::unbounded_channel();
        Session::new(TransportKind::Tcp, queue, tx)
    }

    fn record(registry: &Registry) -> Arc<ClientRecord> {
        let id = registry.allocate_id();
        ClientRecord::new(
            id,
            Identity::generate().fingerprint(),
            test_session(),
            SealingStream::new(&[7u8; 32]),
            format!("client-{}", id),
            ViewState { cols: 80, rows: 24, color: ColorMode::Mono },
            4,
        )
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let registry = Registry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert!(b > a);

        let rec = record(&registry);
        let departed = rec.id;
        registry.insert(rec);
        registry.remove(departed);
        // A departed id is never handed out again.
        assert!(registry.allocate_id() > departed);
    }

    #[test]
    fn snapshot_orders_by_join_time() {
        let registry = Registry::new();
        let first = record(&registry);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = record(&registry);
        registry.insert(second.clone());
        registry.insert(first.clone());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, first.id);
        assert_eq!(snapshot[1].id, second.id);
    }
}
