//! Derivation index allocation.
//!
//! Indexes come from the store so that two engines never hand out the same
//! receiving address. When the store cannot allocate, an in-process counter
//! can take over if `wallet.allow_degraded_allocation` is set; that mode is
//! only safe with a single engine instance and is logged and metered.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::blockchain::types::{BlockchainError, BlockchainResult};
use crate::observability::metrics;
use crate::payments::store::SettlementStore;

pub struct IndexAllocator {
    store: Arc<dyn SettlementStore>,
    fallback: AtomicU32,
    allow_degraded: bool,
    degraded: AtomicBool,
}

impl IndexAllocator {
    pub fn new(store: Arc<dyn SettlementStore>, allow_degraded: bool) -> Self {
        Self {
            store,
            fallback: AtomicU32::new(0),
            allow_degraded,
            degraded: AtomicBool::new(false),
        }
    }

    /// Reserve the next derivation index.
    pub async fn next_index(&self) -> BlockchainResult<u32> {
        match self.store.allocate_index().await {
            Ok(index) => {
                // Keep the fallback ahead of anything the store handed out.
                self.fallback.fetch_max(index.saturating_add(1), Ordering::SeqCst);
                if self.degraded.swap(false, Ordering::SeqCst) {
                    tracing::info!("Index allocation recovered, store is authoritative again");
                    metrics::record_allocator_degraded(false);
                }
                Ok(index)
            }
            Err(e) if self.allow_degraded => {
                let index = self.fallback.fetch_add(1, Ordering::SeqCst);
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    metrics::record_allocator_degraded(true);
                }
                tracing::warn!(
                    error = %e,
                    index = index,
                    "Store allocation failed, using in-process counter (unsafe with multiple instances)"
                );
                Ok(index)
            }
            Err(e) => Err(BlockchainError::Wallet(format!("index allocation failed: {e}"))),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}
