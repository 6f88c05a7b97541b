//! The watch table: addresses the engine is currently reconciling.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::observability::metrics;
use crate::payments::types::WatchedAddress;

/// A concurrent map of address → watch entry, owned by one `ChainWatcher`.
///
/// Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct WatchTable {
    inner: Arc<DashMap<String, WatchedAddress>>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry. Returns false and keeps the existing entry when the
    /// address is already watched.
    pub fn insert(&self, entry: WatchedAddress) -> bool {
        let inserted = match self.inner.entry(entry.address.clone()) {
            Entry::Occupied(existing) => {
                if existing.get().target != entry.target {
                    tracing::warn!(
                        address = %entry.address,
                        existing = %existing.get().target,
                        requested = %entry.target,
                        "Address already watched for another target"
                    );
                }
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        };
        metrics::record_watched_addresses(self.inner.len());
        inserted
    }

    pub fn remove(&self, address: &str) -> Option<WatchedAddress> {
        let removed = self.inner.remove(address).map(|(_, v)| v);
        metrics::record_watched_addresses(self.inner.len());
        removed
    }

    pub fn get(&self, address: &str) -> Option<WatchedAddress> {
        self.inner.get(address).map(|r| r.value().clone())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.inner.contains_key(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.inner.iter().map(|r| r.key().clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<WatchedAddress> {
        let mut entries: Vec<_> = self.inner.iter().map(|r| r.value().clone()).collect();
        entries.sort_by(|a, b| a.address.cmp(&b.address));
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
