//! Chain watch service.
//!
//! `ChainWatcher` owns the watch table and the indexer connection. Activity
//! arrives three ways: pushed address notifications, a periodic sweep of every
//! watched address, and on-demand `check_address` calls. All of them funnel
//! into the reconciler, so overlap between them is harmless.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use uuid::Uuid;

use crate::blockchain::address::Address;
use crate::blockchain::indexer::LedgerIndexer;
use crate::blockchain::types::{BlockchainResult, IndexerEvent, Network};
use crate::payments::cache::WatchTable;
use crate::payments::processor::{ProcessOutcome, Reconciler};
use crate::payments::store::{SettlementStore, StoreResult};
use crate::payments::types::{unix_now, TargetRef, WatchedAddress};
use crate::resilience::backoff::Backoff;

pub struct ChainWatcher {
    indexer: Arc<dyn LedgerIndexer>,
    store: Arc<dyn SettlementStore>,
    table: WatchTable,
    reconciler: Reconciler,
    network: Network,
    listener: Mutex<Option<JoinHandle<()>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    connection_lost: Notify,
}

impl ChainWatcher {
    pub fn new(
        indexer: Arc<dyn LedgerIndexer>,
        store: Arc<dyn SettlementStore>,
        table: WatchTable,
        reconciler: Reconciler,
        network: Network,
    ) -> Self {
        Self {
            indexer,
            store,
            table,
            reconciler,
            network,
            listener: Mutex::new(None),
            poller: Mutex::new(None),
            connection_lost: Notify::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.indexer.is_connected()
    }

    pub fn indexer_name(&self) -> &'static str {
        self.indexer.name()
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn watched(&self) -> Vec<WatchedAddress> {
        self.table.snapshot()
    }

    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .map(|p| p.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Connect to the indexer and subscribe every address already watched.
    ///
    /// On failure the watcher stays disconnected and the table is untouched.
    pub async fn connect(self: &Arc<Self>) -> BlockchainResult<()> {
        let events = match self.indexer.connect().await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(indexer = self.indexer.name(), error = %e, "Indexer connection failed");
                return Err(e);
            }
        };

        let handle = tokio::spawn(self.clone().listen(events));
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(old) = listener.replace(handle) {
                old.abort();
            }
        }

        let addresses = self.table.addresses();
        let mut subscribed = 0;
        for address in &addresses {
            if self.subscribe(address).await {
                subscribed += 1;
            }
        }
        tracing::info!(
            indexer = self.indexer.name(),
            watched = addresses.len(),
            subscribed = subscribed,
            "Chain watcher connected"
        );
        Ok(())
    }

    async fn listen(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<IndexerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                IndexerEvent::AddressActivity { address } => {
                    tracing::debug!(address = %address, "Address activity");
                    self.check_address(&address).await;
                }
                IndexerEvent::NewTip { height } => {
                    // Depth changes do not trigger address notifications.
                    tracing::debug!(height = height, "New block");
                    let watcher = self.clone();
                    tokio::spawn(async move { watcher.sweep().await });
                }
                IndexerEvent::Disconnected { reason } => {
                    tracing::warn!(reason = %reason, "Chain watcher lost indexer");
                    break;
                }
            }
        }
        self.connection_lost.notify_one();
    }

    /// Release the connection. The watch table survives.
    pub async fn disconnect(&self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
        self.indexer.disconnect().await;
        tracing::info!(watched = self.table.len(), "Chain watcher disconnected");
    }

    /// Keep the connection up until shutdown, reconnecting with backoff and
    /// rehydrating from the store after every (re)connect.
    pub async fn supervise(self: Arc<Self>, mut backoff: Backoff, mut shutdown: broadcast::Receiver<()>) {
        loop {
            if !self.is_connected() {
                match self.connect().await {
                    Ok(()) => {
                        backoff.reset();
                        self.rehydrate().await;
                        self.sweep().await;
                    }
                    Err(_) => {
                        let delay = backoff.next_delay();
                        tracing::warn!(
                            attempt = backoff.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            "Retrying indexer connection"
                        );
                        tokio::select! {
                            _ = sleep(delay) => continue,
                            _ = shutdown.recv() => break,
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.connection_lost.notified() => {}
                _ = shutdown.recv() => break,
            }
        }
        self.stop_polling();
        self.disconnect().await;
    }

    async fn rehydrate(&self) {
        if let Err(e) = self.load_active_payment_links().await {
            tracing::error!(error = %e, "Failed to load active payment links");
        }
        if let Err(e) = self.load_active_contracts().await {
            tracing::error!(error = %e, "Failed to load active contracts");
        }
    }

    fn canonical(&self, address: &str) -> String {
        Address::parse(address, self.network)
            .map(|a| a.to_cashaddr())
            .unwrap_or_else(|_| address.to_string())
    }

    async fn subscribe(&self, address: &str) -> bool {
        if !self.indexer.is_connected() {
            return false;
        }
        let parsed = match Address::parse(address, self.network) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "Cannot subscribe malformed address");
                return false;
            }
        };
        match self.indexer.subscribe_address(&parsed).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "Address subscription failed");
                false
            }
        }
    }

    /// Start watching an address for a target. Idempotent; returns whether
    /// the address was newly added.
    pub async fn watch_address(
        &self,
        address: &str,
        target: TargetRef,
        owner_id: &str,
        expected_amount: Option<u64>,
        accept_zero_conf: bool,
    ) -> BlockchainResult<bool> {
        let address = Address::parse(address, self.network)?.to_cashaddr();
        let inserted = self.table.insert(WatchedAddress {
            address: address.clone(),
            target,
            owner_id: owner_id.to_string(),
            expected_amount,
            accept_zero_conf,
            registered_at: unix_now(),
        });
        if inserted {
            let subscribed = self.subscribe(&address).await;
            tracing::info!(
                address = %address,
                target = %target,
                subscribed = subscribed,
                "Watching address"
            );
        }
        Ok(inserted)
    }

    pub async fn watch_contract_address(
        &self,
        address: &str,
        contract_id: Uuid,
        owner_id: &str,
    ) -> BlockchainResult<bool> {
        self.watch_address(address, TargetRef::contract(contract_id), owner_id, None, false)
            .await
    }

    /// Stop watching. Returns false if the address was not watched.
    pub async fn unwatch(&self, address: &str) -> bool {
        let address = self.canonical(address);
        if self.table.remove(&address).is_none() {
            return false;
        }
        if self.indexer.is_connected() {
            if let Ok(parsed) = Address::parse(&address, self.network) {
                if let Err(e) = self.indexer.unsubscribe_address(&parsed).await {
                    tracing::debug!(address = %address, error = %e, "Unsubscribe failed");
                }
            }
        }
        tracing::info!(address = %address, "Stopped watching address");
        true
    }

    /// Query the address's history and reconcile every transfer found.
    ///
    /// Returns nothing when disconnected or when the indexer errors.
    pub async fn check_address(&self, address: &str) -> Vec<ProcessOutcome> {
        let address = self.canonical(address);
        if !self.indexer.is_connected() || !self.table.contains(&address) {
            return Vec::new();
        }
        let parsed = match Address::parse(&address, self.network) {
            Ok(parsed) => parsed,
            Err(_) => return Vec::new(),
        };
        let history = match self.indexer.address_history(&parsed).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "History query failed");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(history.len());
        for transfer in &history {
            match self
                .reconcile(
                    &address,
                    &transfer.tx_id,
                    transfer.amount,
                    transfer.confirmations,
                    transfer.block_height,
                )
                .await
            {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::error!(address = %address, tx_id = %transfer.tx_id, error = %e, "Reconciliation failed");
                }
            }
        }

        let seen: HashSet<&str> = history.iter().map(|t| t.tx_id.as_str()).collect();
        if let Err(e) = self.reconciler.fail_dropped(&address, &seen).await {
            tracing::error!(address = %address, error = %e, "Dropped-payment check failed");
        }
        outcomes
    }

    /// Reconcile one observed transfer.
    pub async fn process_payment(
        &self,
        address: &str,
        tx_id: &str,
        amount: u64,
        confirmations: u32,
    ) -> StoreResult<ProcessOutcome> {
        let address = self.canonical(address);
        self.reconcile(&address, tx_id, amount, confirmations, None)
            .await
    }

    async fn reconcile(
        &self,
        address: &str,
        tx_id: &str,
        amount: u64,
        confirmations: u32,
        block_height: Option<u64>,
    ) -> StoreResult<ProcessOutcome> {
        let outcome = self
            .reconciler
            .process(address, tx_id, amount, confirmations, block_height)
            .await?;
        if let (Some(record), Some(watched)) = (outcome.record(), self.table.get(address)) {
            if self.reconciler.should_release(&watched, record).await? {
                tracing::info!(address = %address, tx_id = %tx_id, "Target settled, releasing address");
                self.unwatch(address).await;
            }
        }
        Ok(outcome)
    }

    /// Watch every active payment link. Returns how many were added.
    pub async fn load_active_payment_links(&self) -> StoreResult<usize> {
        let links = self.store.active_payment_links().await?;
        let mut added = 0;
        for link in links {
            let Some(address) = link.address.as_deref() else {
                tracing::warn!(link = %link.id, "Active payment link has no address");
                continue;
            };
            match self
                .watch_address(
                    address,
                    TargetRef::payment_link(link.id),
                    &link.owner_id,
                    link.amount,
                    link.accept_zero_conf,
                )
                .await
            {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(link = %link.id, error = %e, "Skipping payment link"),
            }
        }
        tracing::info!(added = added, "Payment links loaded");
        Ok(added)
    }

    /// Watch every contract that may still receive funds.
    pub async fn load_active_contracts(&self) -> StoreResult<usize> {
        let contracts = self.store.active_contracts().await?;
        let mut added = 0;
        for contract in contracts {
            match self
                .watch_contract_address(&contract.address, contract.id, &contract.owner_id)
                .await
            {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(contract = %contract.id, error = %e, "Skipping contract"),
            }
        }
        tracing::info!(added = added, "Contracts loaded");
        Ok(added)
    }

    /// Check every watched address once.
    pub async fn sweep(&self) {
        for address in self.table.addresses() {
            self.check_address(&address).await;
        }
    }

    /// Sweep all watched addresses every `interval`. Replaces any running poller.
    pub fn start_polling(self: &Arc<Self>, interval: Duration) {
        let watcher = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                tracing::trace!(watched = watcher.table.len(), "Polling sweep");
                watcher.sweep().await;
            }
        });
        if let Ok(mut poller) = self.poller.lock() {
            if let Some(old) = poller.replace(handle) {
                old.abort();
            }
        }
        tracing::info!(interval_ms = interval.as_millis() as u64, "Polling started");
    }

    pub fn stop_polling(&self) {
        if let Ok(mut poller) = self.poller.lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
                tracing::info!("Polling stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::memory::MemoryIndexer;
    use crate::blockchain::types::AddressTransfer;
    use crate::notifications::queue::notification_queue;
    use crate::notifications::types::NotificationRequest;
    use crate::payments::processor::ReconcilePolicy;
    use crate::payments::store::MemoryStore;
    use crate::payments::types::{LinkKind, PaymentLink, SettlementTarget, TxStatus};

    const ADDR: &str = "bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a";
    const LEGACY: &str = "1BpEi6DfDAUFd7GtittLSdBeYJvcoaVggu";

    struct Harness {
        watcher: Arc<ChainWatcher>,
        indexer: Arc<MemoryIndexer>,
        store: Arc<MemoryStore>,
        rx: mpsc::UnboundedReceiver<NotificationRequest>,
    }

    fn harness() -> Harness {
        let indexer = Arc::new(MemoryIndexer::new(Network::Mainnet));
        let store = Arc::new(MemoryStore::new());
        let table = WatchTable::new();
        let (queue, rx) = notification_queue();
        let reconciler = Reconciler::new(table.clone(), store.clone(), queue, ReconcilePolicy::default());
        let watcher = Arc::new(ChainWatcher::new(
            indexer.clone(),
            store.clone(),
            table,
            reconciler,
            Network::Mainnet,
        ));
        Harness {
            watcher,
            indexer,
            store,
            rx,
        }
    }

    async fn single_link(store: &MemoryStore) -> PaymentLink {
        let link = PaymentLink {
            id: Uuid::new_v4(),
            owner_id: "m1".to_string(),
            kind: LinkKind::Single,
            address: Some(ADDR.to_string()),
            derivation_index: Some(0),
            amount: Some(50_000),
            accept_zero_conf: false,
            active: true,
            created_at: 0,
        };
        store
            .insert_target(SettlementTarget::PaymentLink(link.clone()))
            .await
            .unwrap();
        link
    }

    fn address() -> Address {
        Address::parse(ADDR, Network::Mainnet).unwrap()
    }

    #[tokio::test]
    async fn test_watch_before_connect_subscribes_on_connect() {
        let h = harness();
        let target = TargetRef::payment_link(Uuid::new_v4());
        assert!(h.watcher.watch_address(LEGACY, target, "m1", None, false).await.unwrap());
        assert!(!h.watcher.watch_address(ADDR, target, "m1", None, false).await.unwrap());
        assert!(h.indexer.subscriptions().is_empty());

        h.watcher.connect().await.unwrap();
        assert!(h.indexer.subscriptions().contains(ADDR));
        assert_eq!(h.watcher.watched().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_address_rejected() {
        let h = harness();
        let target = TargetRef::payment_link(Uuid::new_v4());
        assert!(h.watcher.watch_address("nonsense", target, "m1", None, false).await.is_err());
        assert!(h.watcher.watched().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let h = harness();
        h.indexer.set_unavailable(true);
        assert!(h.watcher.connect().await.is_err());
        assert!(!h.watcher.is_connected());
        assert!(h.watcher.check_address(ADDR).await.is_empty());
    }

    #[tokio::test]
    async fn test_unwatch_is_quiet_when_absent() {
        let h = harness();
        h.watcher.connect().await.unwrap();
        let target = TargetRef::payment_link(Uuid::new_v4());
        h.watcher.watch_address(ADDR, target, "m1", None, false).await.unwrap();
        assert!(h.watcher.unwatch(LEGACY).await);
        assert!(!h.watcher.unwatch(ADDR).await);
        assert!(h.indexer.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_single_link_settles_and_releases_at_finality() {
        let mut h = harness();
        let link = single_link(&h.store).await;
        h.watcher.connect().await.unwrap();
        assert_eq!(h.watcher.load_active_payment_links().await.unwrap(), 1);

        let transfer = AddressTransfer {
            tx_id: "h1".repeat(32),
            amount: 50_000,
            confirmations: 1,
            block_height: Some(800_000),
        };
        h.indexer.record_transfer(&address(), transfer.clone());
        let outcomes = h.watcher.check_address(ADDR).await;
        assert!(matches!(outcomes.as_slice(), [ProcessOutcome::Created(r)] if r.status == TxStatus::Confirmed));
        assert!(h.store.active_payment_links().await.unwrap().is_empty());
        assert_eq!(h.watcher.watched().len(), 1);

        h.indexer.record_transfer(&address(), AddressTransfer { confirmations: 6, ..transfer });
        let outcomes = h.watcher.check_address(ADDR).await;
        assert!(matches!(outcomes.as_slice(), [ProcessOutcome::Updated(r)] if r.confirmations == 6));
        assert!(h.watcher.watched().is_empty());

        let mut notes = Vec::new();
        while let Ok(n) = h.rx.try_recv() {
            notes.push(n);
        }
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].payload["target"]["id"], link.id.to_string());
    }

    #[tokio::test]
    async fn test_pushed_activity_is_reconciled() {
        let h = harness();
        single_link(&h.store).await;
        h.watcher.connect().await.unwrap();
        h.watcher.load_active_payment_links().await.unwrap();

        h.indexer.record_transfer(
            &address(),
            AddressTransfer {
                tx_id: "ab".repeat(32),
                amount: 50_000,
                confirmations: 2,
                block_height: Some(10),
            },
        );

        let mut recorded = false;
        for _ in 0..50 {
            if h.store.find_transaction(&"ab".repeat(32)).await.unwrap().is_some() {
                recorded = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(recorded);
    }

    #[tokio::test]
    async fn test_polling_lifecycle() {
        let h = harness();
        h.watcher.start_polling(Duration::from_secs(60));
        assert!(h.watcher.is_polling());
        h.watcher.stop_polling();
        assert!(!h.watcher.is_polling());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_table() {
        let h = harness();
        h.watcher.connect().await.unwrap();
        let target = TargetRef::payment_link(Uuid::new_v4());
        h.watcher.watch_address(ADDR, target, "m1", None, false).await.unwrap();
        h.watcher.disconnect().await;
        assert!(!h.watcher.is_connected());
        assert_eq!(h.watcher.watched().len(), 1);
    }
}
