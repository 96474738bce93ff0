//! Admission control for GAL syncs.
//!
//! Each domain admits a bounded number of concurrent sync clients. A slot is held by a [`SyncSlot`] guard and
//! released when the guard drops, including during a panic unwind.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

/// Active sync client ids per domain.
#[derive(Debug, Default)]
pub struct SyncClientRegistry {
    clients: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl SyncClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BTreeSet<String>>> {
        match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `client_id` for `domain` if fewer than `capacity` clients
    /// are active (0 = unlimited). Returns whether the client was admitted.
    pub fn try_acquire(&self, domain: &str, client_id: &str, capacity: u32) -> bool {
        let mut clients = self.lock();
        let active = clients.entry(domain.to_string()).or_default();
        if capacity != 0 && active.len() >= capacity as usize {
            debug!(
                domain,
                client = client_id,
                busy = ?active,
                "Sync limit reached, turning client away"
            );
            return false;
        }
        active.insert(client_id.to_string());
        true
    }

    pub fn release(&self, domain: &str, client_id: &str) {
        let mut clients = self.lock();
        if let Some(active) = clients.get_mut(domain) {
            active.remove(client_id);
            if active.is_empty() {
                clients.remove(domain);
            }
        }
    }

    /// Number of active clients for `domain`.
    pub fn active(&self, domain: &str) -> usize {
        self.lock().get(domain).map_or(0, BTreeSet::len)
    }

    /// Admit a client and return a guard that releases it on drop.
    pub fn acquire(
        self: &Arc<Self>,
        domain: &str,
        client_id: &str,
        capacity: u32,
    ) -> Option<SyncSlot> {
        self.try_acquire(domain, client_id, capacity).then(|| SyncSlot {
            registry: Arc::clone(self),
            domain: domain.to_string(),
            client_id: client_id.to_string(),
        })
    }
}

/// An admitted sync client.
#[derive(Debug)]
pub struct SyncSlot {
    registry: Arc<SyncClientRegistry>,
    domain: String,
    client_id: String,
}

impl Drop for SyncSlot {
    fn drop(&mut self) {
        self.registry.release(&self.domain, &self.client_id);
    }
}

/// Client id of the calling thread: `thread name / user info`.
pub fn client_id(user_info: &str) -> String {
    let thread = std::thread::current();
    let name = match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    };
    format!("{name} / {user_info}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_enforced() {
        let registry = SyncClientRegistry::new();
        assert!(registry.try_acquire("example.com", "t1 / a", 2));
        assert!(registry.try_acquire("example.com", "t2 / b", 2));
        assert!(!registry.try_acquire("example.com", "t3 / c", 2));
        // Other domains have their own slots.
        assert!(registry.try_acquire("other.com", "t3 / c", 2));

        registry.release("example.com", "t1 / a");
        assert!(registry.try_acquire("example.com", "t3 / c", 2));
    }

    #[test]
    fn test_zero_capacity_is_unlimited() {
        let registry = SyncClientRegistry::new();
        for i in 0..50 {
            assert!(registry.try_acquire("example.com", &format!("t{i}"), 0));
        }
        assert_eq!(registry.active("example.com"), 50);
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let registry = Arc::new(SyncClientRegistry::new());
        let r = Arc::clone(&registry);
        let result = std::thread::spawn(move || {
            let _slot = r.acquire("example.com", "worker / a", 1).unwrap();
            panic!("sync failed");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(registry.active("example.com"), 0);
    }

    #[test]
    fn test_client_id_format() {
        let id = std::thread::Builder::new()
            .name("sync-7".into())
            .spawn(|| client_id("ann@example.com"))
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(id, "sync-7 / ann@example.com");
    }
}
