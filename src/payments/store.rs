//! Settlement-target persistence.
//!
//! `SettlementStore` is the seam to whatever database owns payment links,
//! contracts, transaction records and notification events. Every method that
//! reads-then-writes does so atomically; reconciliation relies on
//! `upsert_transaction` to keep one record per ledger txid no matter how many
//! observers race.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::notifications::types::NotificationEvent;
use crate::payments::types::{
    unix_now, ContractInstance, ContractStatus, Observation, PaymentLink, SettlementTarget,
    TargetRef, TransactionRecord, TxStatus, UpsertOutcome,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn insert_target(&self, target: SettlementTarget) -> StoreResult<()>;

    async fn find_target(&self, target: &TargetRef) -> StoreResult<Option<SettlementTarget>>;

    async fn find_target_by_address(&self, address: &str)
        -> StoreResult<Option<SettlementTarget>>;

    async fn active_payment_links(&self) -> StoreResult<Vec<PaymentLink>>;

    /// Contracts that may still receive funds.
    async fn active_contracts(&self) -> StoreResult<Vec<ContractInstance>>;

    /// Mark a link INACTIVE. Returns false if it already was.
    async fn close_payment_link(&self, id: Uuid) -> StoreResult<bool>;

    /// Move a contract ACTIVE → FUNDED. Returns false from any other status.
    async fn mark_contract_funded(&self, id: Uuid) -> StoreResult<bool>;

    /// Status changes driven by release, refund and dispute flows.
    async fn set_contract_status(&self, id: Uuid, status: ContractStatus) -> StoreResult<()>;

    /// Create the record for a new txid or update confirmations on the
    /// existing one, in a single step.
    async fn upsert_transaction(&self, observation: Observation) -> StoreResult<UpsertOutcome>;

    async fn find_transaction(&self, tx_id: &str) -> StoreResult<Option<TransactionRecord>>;

    async fn pending_transactions(&self, address: &str) -> StoreResult<Vec<TransactionRecord>>;

    /// PENDING → FAILED. Returns false for any other status.
    async fn mark_transaction_failed(&self, tx_id: &str) -> StoreResult<bool>;

    /// Flag a CONFIRMED record as settled. Returns false if it already was,
    /// so exactly one caller wins.
    async fn mark_transaction_settled(&self, tx_id: &str) -> StoreResult<bool>;

    /// Reserve the next unused derivation index.
    async fn allocate_index(&self) -> StoreResult<u32>;

    async fn save_notification(&self, event: &NotificationEvent) -> StoreResult<()>;

    async fn find_notification(&self, id: Uuid) -> StoreResult<Option<NotificationEvent>>;
}

#[derive(Default, Serialize, Deserialize)]
struct StoreState {
    targets: HashMap<Uuid, SettlementTarget>,
    transactions: HashMap<String, TransactionRecord>,
    notifications: HashMap<Uuid, NotificationEvent>,
    last_index: Option<u32>,
}

/// In-process store with optional JSON snapshot persistence.
///
/// Snapshots are taken under the state lock and written on the blocking pool.
/// Each carries a version assigned under that lock, and a write never replaces
/// a newer file.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    persistence_path: Option<PathBuf>,
    snapshot_version: AtomicU64,
    written_version: Arc<Mutex<u64>>,
    operations: AtomicU64,
    unavailable: AtomicBool,
}

struct Snapshot {
    version: u64,
    bytes: Vec<u8>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_state(StoreState::default(), None)
    }

    /// Open a store backed by a snapshot file, loading it if it exists.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let state = if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            let state: StoreState = serde_json::from_reader(reader)?;
            tracing::info!(
                path = %path.display(),
                targets = state.targets.len(),
                transactions = state.transactions.len(),
                "Loaded settlement snapshot"
            );
            state
        } else {
            StoreState::default()
        };
        Ok(Self::with_state(state, Some(path.to_path_buf())))
    }

    fn with_state(state: StoreState, persistence_path: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(state),
            persistence_path,
            snapshot_version: AtomicU64::new(0),
            written_version: Arc::new(Mutex::new(0)),
            operations: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Number of trait calls served so far.
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Make every call fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn transaction_count(&self) -> usize {
        self.state.lock().map(|s| s.transactions.len()).unwrap_or(0)
    }

    fn begin(&self) -> StoreResult<MutexGuard<'_, StoreState>> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    /// Serialize `state`. Must be called with the state lock held so versions
    /// follow mutation order.
    fn snapshot(&self, state: &StoreState) -> StoreResult<Option<Snapshot>> {
        if self.persistence_path.is_none() {
            return Ok(None);
        }
        let bytes = serde_json::to_vec(state)?;
        let version = self.snapshot_version.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(Snapshot { version, bytes }))
    }

    async fn persist(&self, snapshot: Option<Snapshot>) -> StoreResult<()> {
        let (Some(snapshot), Some(path)) = (snapshot, self.persistence_path.clone()) else {
            return Ok(());
        };
        let written = self.written_version.clone();
        tokio::task::spawn_blocking(move || write_if_newer(&path, &written, snapshot))
            .await
            .map_err(|e| StoreError::Unavailable(format!("snapshot writer: {e}")))?
    }
}

/// Replace the file at `path` with `snapshot` unless a newer one already
/// landed. Writes go through a sibling temp file and a rename.
fn write_if_newer(path: &Path, written: &Mutex<u64>, snapshot: Snapshot) -> StoreResult<()> {
    let mut last = written
        .lock()
        .map_err(|_| StoreError::Unavailable("snapshot lock poisoned".to_string()))?;
    if snapshot.version <= *last {
        tracing::trace!(version = snapshot.version, latest = *last, "Skipping stale snapshot");
        return Ok(());
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_all(&snapshot.bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    *last = snapshot.version;
    tracing::trace!(path = %path.display(), version = snapshot.version, "Snapshot written");
    Ok(())
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn insert_target(&self, target: SettlementTarget) -> StoreResult<()> {
        let snapshot = {
            let mut state = self.begin()?;
            let id = target.target_ref().id;
            if state.targets.contains_key(&id) {
                return Err(StoreError::Conflict(format!("target {id} exists")));
            }
            if let SettlementTarget::PaymentLink(link) = &target {
                if let Some(index) = link.derivation_index {
                    state.last_index = Some(state.last_index.map_or(index, |last| last.max(index)));
                }
            }
            state.targets.insert(id, target);
            self.snapshot(&state)?
        };
        self.persist(snapshot).await
    }

    async fn find_target(&self, target: &TargetRef) -> StoreResult<Option<SettlementTarget>> {
        let state = self.begin()?;
        Ok(state
            .targets
            .get(&target.id)
            .filter(|t| t.target_ref().kind == target.kind)
            .cloned())
    }

    async fn find_target_by_address(
        &self,
        address: &str,
    ) -> StoreResult<Option<SettlementTarget>> {
        let state = self.begin()?;
        Ok(state
            .targets
            .values()
            .find(|t| t.address() == Some(address))
            .cloned())
    }

    async fn active_payment_links(&self) -> StoreResult<Vec<PaymentLink>> {
        let state = self.begin()?;
        Ok(state
            .targets
            .values()
            .filter_map(|t| match t {
                SettlementTarget::PaymentLink(link) if link.active => Some(link.clone()),
                _ => None,
            })
            .collect())
    }

    async fn active_contracts(&self) -> StoreResult<Vec<ContractInstance>> {
        let state = self.begin()?;
        Ok(state
            .targets
            .values()
            .filter_map(|t| match t {
                SettlementTarget::Contract(c) if !c.status.is_terminal() => Some(c.clone()),
                _ => None,
            })
            .collect())
    }

    async fn close_payment_link(&self, id: Uuid) -> StoreResult<bool> {
        let (changed, snapshot) = {
            let mut state = self.begin()?;
            let changed = match state.targets.get_mut(&id) {
                Some(SettlementTarget::PaymentLink(link)) => std::mem::replace(&mut link.active, false),
                _ => return Err(StoreError::NotFound(format!("payment link {id}"))),
            };
            let snapshot = if changed { self.snapshot(&state)? } else { None };
            (changed, snapshot)
        };
        self.persist(snapshot).await?;
        Ok(changed)
    }

    async fn mark_contract_funded(&self, id: Uuid) -> StoreResult<bool> {
        let (changed, snapshot) = {
            let mut state = self.begin()?;
            let changed = match state.targets.get_mut(&id) {
                Some(SettlementTarget::Contract(contract)) => {
                    if contract.status == ContractStatus::Active {
                        contract.status = ContractStatus::Funded;
                        true
                    } else {
                        false
                    }
                }
                _ => return Err(StoreError::NotFound(format!("contract {id}"))),
            };
            let snapshot = if changed { self.snapshot(&state)? } else { None };
            (changed, snapshot)
        };
        self.persist(snapshot).await?;
        Ok(changed)
    }

    async fn set_contract_status(&self, id: Uuid, status: ContractStatus) -> StoreResult<()> {
        let snapshot = {
            let mut state = self.begin()?;
            match state.targets.get_mut(&id) {
                Some(SettlementTarget::Contract(contract)) => contract.status = status,
                _ => return Err(StoreError::NotFound(format!("contract {id}"))),
            }
            self.snapshot(&state)?
        };
        self.persist(snapshot).await
    }

    async fn upsert_transaction(&self, observation: Observation) -> StoreResult<UpsertOutcome> {
        let (outcome, snapshot) = {
            let mut state = self.begin()?;
            let now = unix_now();
            let outcome = match state.transactions.get_mut(&observation.tx_id) {
                Some(record) => {
                    record.confirmations = observation.confirmations;
                    record.block_height = observation.block_height.or(record.block_height);
                    record.updated_at = now;
                    let promoted = record.status != TxStatus::Confirmed
                        && observation.status == TxStatus::Confirmed;
                    if promoted {
                        record.status = TxStatus::Confirmed;
                    }
                    UpsertOutcome::Updated {
                        record: record.clone(),
                        promoted,
                    }
                }
                None => {
                    let record = TransactionRecord {
                        tx_id: observation.tx_id.clone(),
                        address: observation.address,
                        amount: observation.amount,
                        confirmations: observation.confirmations,
                        status: observation.status,
                        block_height: observation.block_height,
                        target: observation.target,
                        settled: false,
                        created_at: now,
                        updated_at: now,
                    };
                    state.transactions.insert(observation.tx_id, record.clone());
                    UpsertOutcome::Created(record)
                }
            };
            (outcome, self.snapshot(&state)?)
        };
        self.persist(snapshot).await?;
        Ok(outcome)
    }

    async fn find_transaction(&self, tx_id: &str) -> StoreResult<Option<TransactionRecord>> {
        let state = self.begin()?;
        Ok(state.transactions.get(tx_id).cloned())
    }

    async fn pending_transactions(&self, address: &str) -> StoreResult<Vec<TransactionRecord>> {
        let state = self.begin()?;
        Ok(state
            .transactions
            .values()
            .filter(|r| r.address == address && r.status == TxStatus::Pending)
            .cloned()
            .collect())
    }

    async fn mark_transaction_failed(&self, tx_id: &str) -> StoreResult<bool> {
        let (changed, snapshot) = {
            let mut state = self.begin()?;
            let changed = match state.transactions.get_mut(tx_id) {
                Some(record) if record.status == TxStatus::Pending => {
                    record.status = TxStatus::Failed;
                    record.updated_at = unix_now();
                    true
                }
                Some(_) => false,
                None => return Err(StoreError::NotFound(format!("transaction {tx_id}"))),
            };
            let snapshot = if changed { self.snapshot(&state)? } else { None };
            (changed, snapshot)
        };
        self.persist(snapshot).await?;
        Ok(changed)
    }

    async fn mark_transaction_settled(&self, tx_id: &str) -> StoreResult<bool> {
        let (changed, snapshot) = {
            let mut state = self.begin()?;
            let changed = match state.transactions.get_mut(tx_id) {
                Some(record) if record.status == TxStatus::Confirmed => {
                    let changed = !std::mem::replace(&mut record.settled, true);
                    if changed {
                        record.updated_at = unix_now();
                    }
                    changed
                }
                Some(record) => {
                    return Err(StoreError::Conflict(format!(
                        "transaction {tx_id} is {}",
                        record.status.as_str()
                    )))
                }
                None => return Err(StoreError::NotFound(format!("transaction {tx_id}"))),
            };
            let snapshot = if changed { self.snapshot(&state)? } else { None };
            (changed, snapshot)
        };
        self.persist(snapshot).await?;
        Ok(changed)
    }

    async fn allocate_index(&self) -> StoreResult<u32> {
        let (next, snapshot) = {
            let mut state = self.begin()?;
            let next = match state.last_index {
                Some(last) => last.checked_add(1).ok_or_else(|| {
                    StoreError::Conflict("derivation index space exhausted".into())
                })?,
                None => 0,
            };
            state.last_index = Some(next);
            (next, self.snapshot(&state)?)
        };
        self.persist(snapshot).await?;
        Ok(next)
    }

    async fn save_notification(&self, event: &NotificationEvent) -> StoreResult<()> {
        let snapshot = {
            let mut state = self.begin()?;
            state.notifications.insert(event.id, event.clone());
            self.snapshot(&state)?
        };
        self.persist(snapshot).await
    }

    async fn find_notification(&self, id: Uuid) -> StoreResult<Option<NotificationEvent>> {
        let state = self.begin()?;
        Ok(state.notifications.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{LinkKind, TargetKind};

    fn link(index: u32) -> PaymentLink {
        PaymentLink {
            id: Uuid::new_v4(),
            owner_id: "m1".to_string(),
            kind: LinkKind::Single,
            address: Some(format!("addr-{index}")),
            derivation_index: Some(index),
            amount: Some(50_000),
            accept_zero_conf: false,
            active: true,
            created_at: 0,
        }
    }

    fn observation(target: TargetRef, confirmations: u32, status: TxStatus) -> Observation {
        Observation {
            tx_id: "h1".to_string(),
            address: "addr-0".to_string(),
            amount: 50_000,
            confirmations,
            block_height: None,
            status,
            target,
        }
    }

    #[tokio::test]
    async fn test_upsert_dedupes_and_promotes() {
        let store = MemoryStore::new();
        let target = TargetRef::payment_link(Uuid::new_v4());

        let first = store
            .upsert_transaction(observation(target, 0, TxStatus::Pending))
            .await
            .unwrap();
        assert!(matches!(first, UpsertOutcome::Created(ref r) if r.status == TxStatus::Pending));

        let second = store
            .upsert_transaction(observation(target, 1, TxStatus::Confirmed))
            .await
            .unwrap();
        match second {
            UpsertOutcome::Updated { record, promoted } => {
                assert!(promoted);
                assert_eq!(record.confirmations, 1);
                assert_eq!(record.status, TxStatus::Confirmed);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let third = store
            .upsert_transaction(observation(target, 6, TxStatus::Confirmed))
            .await
            .unwrap();
        assert!(matches!(third, UpsertOutcome::Updated { promoted: false, .. }));
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_settled_marker_survives_updates() {
        let store = MemoryStore::new();
        let target = TargetRef::payment_link(Uuid::new_v4());

        store
            .upsert_transaction(observation(target, 0, TxStatus::Pending))
            .await
            .unwrap();
        assert!(matches!(
            store.mark_transaction_settled("h1").await,
            Err(StoreError::Conflict(_))
        ));

        let promoted = store
            .upsert_transaction(observation(target, 1, TxStatus::Confirmed))
            .await
            .unwrap();
        assert!(matches!(promoted, UpsertOutcome::Updated { ref record, .. } if !record.settled));
        assert!(store.mark_transaction_settled("h1").await.unwrap());
        assert!(!store.mark_transaction_settled("h1").await.unwrap());

        let later = store
            .upsert_transaction(observation(target, 6, TxStatus::Confirmed))
            .await
            .unwrap();
        assert!(matches!(later, UpsertOutcome::Updated { ref record, .. } if record.settled));
        assert!(matches!(
            store.mark_transaction_settled("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_link_once() {
        let store = MemoryStore::new();
        let link = link(0);
        store
            .insert_target(SettlementTarget::PaymentLink(link.clone()))
            .await
            .unwrap();

        assert!(store.close_payment_link(link.id).await.unwrap());
        assert!(!store.close_payment_link(link.id).await.unwrap());
        assert!(store.active_payment_links().await.unwrap().is_empty());

        let found = store
            .find_target(&TargetRef::payment_link(link.id))
            .await
            .unwrap()
            .unwrap();
        assert!(!found.is_open());
        assert!(store
            .find_target(&TargetRef {
                kind: TargetKind::Contract,
                id: link.id
            })
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_contract_funded_only_from_active() {
        let store = MemoryStore::new();
        let contract = ContractInstance {
            id: Uuid::new_v4(),
            owner_id: "m1".to_string(),
            address: "escrow".to_string(),
            status: ContractStatus::Active,
            created_at: 0,
        };
        store
            .insert_target(SettlementTarget::Contract(contract.clone()))
            .await
            .unwrap();
        assert!(store.mark_contract_funded(contract.id).await.unwrap());
        assert!(!store.mark_contract_funded(contract.id).await.unwrap());

        store
            .set_contract_status(contract.id, ContractStatus::Released)
            .await
            .unwrap();
        assert!(store.active_contracts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_allocate_index_skips_used() {
        let store = MemoryStore::new();
        assert_eq!(store.allocate_index().await.unwrap(), 0);
        store
            .insert_target(SettlementTarget::PaymentLink(link(7)))
            .await
            .unwrap();
        assert_eq!(store.allocate_index().await.unwrap(), 8);
        assert_eq!(store.allocate_index().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_unavailable_counts_operations() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.allocate_index().await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.operation_count(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let path = std::env::temp_dir().join(format!("settlement-{}.json", Uuid::new_v4()));
        let link = link(3);
        {
            let store = MemoryStore::open(&path).unwrap();
            store
                .insert_target(SettlementTarget::PaymentLink(link.clone()))
                .await
                .unwrap();
            store
                .upsert_transaction(observation(
                    TargetRef::payment_link(link.id),
                    1,
                    TxStatus::Confirmed,
                ))
                .await
                .unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.active_payment_links().await.unwrap(), vec![link]);
        assert!(reopened.find_transaction("h1").await.unwrap().is_some());
        assert_eq!(reopened.allocate_index().await.unwrap(), 4);

        std::fs::remove_file(&path).unwrap_or_default();
    }

    #[test]
    fn test_stale_snapshot_never_overwrites_newer() {
        let path = std::env::temp_dir().join(format!("settlement-{}.json", Uuid::new_v4()));
        let written = Mutex::new(0);
        let newer = Snapshot {
            version: 2,
            bytes: b"{\"v\":2}".to_vec(),
        };
        let older = Snapshot {
            version: 1,
            bytes: b"{\"v\":1}".to_vec(),
        };

        write_if_newer(&path, &written, newer).unwrap();
        write_if_newer(&path, &written, older).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"v\":2}");
        assert_eq!(*written.lock().unwrap(), 2);

        std::fs::remove_file(&path).unwrap_or_default();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_persist_latest_state() {
        let path = std::env::temp_dir().join(format!("settlement-{}.json", Uuid::new_v4()));
        {
            let store = Arc::new(MemoryStore::open(&path).unwrap());
            let mut handles = Vec::new();
            for _ in 0..32 {
                let store = store.clone();
                handles.push(tokio::spawn(async move { store.allocate_index().await.unwrap() }));
            }
            let mut indices = Vec::new();
            for handle in handles {
                indices.push(handle.await.unwrap());
            }
            indices.sort_unstable();
            assert_eq!(indices, (0..32).collect::<Vec<_>>());
        }

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.allocate_index().await.unwrap(), 32);

        std::fs::remove_file(&path).unwrap_or_default();
    }
}
