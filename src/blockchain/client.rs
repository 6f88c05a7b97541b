//! Electrum-protocol indexer client over WebSocket.
//!
//! # Responsibilities
//! - Connect to the indexer endpoint, failing over to secondary URLs
//! - Correlate JSON-RPC responses with pending requests
//! - Forward address and header notifications as [`IndexerEvent`]s
//! - Enforce a timeout on every request

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use crate::blockchain::address::Address;
use crate::blockchain::indexer::LedgerIndexer;
use crate::blockchain::transaction::encode::sha256d;
use crate::blockchain::transaction::Transaction;
use crate::blockchain::types::{
    AddressTransfer, BlockchainError, BlockchainResult, IndexerConfig, IndexerEvent, Network,
    UnspentOutput,
};
use crate::observability::metrics;

const CLIENT_NAME: &str = concat!("settlement-engine/", env!("CARGO_PKG_VERSION"));
const PROTOCOL_VERSION: &str = "1.4";

type PendingMap = DashMap<u64, oneshot::Sender<Result<Value, String>>>;

#[derive(Debug, Deserialize)]
struct HistoryItem {
    tx_hash: String,
    height: i64,
}

#[derive(Debug, Deserialize)]
struct UnspentItem {
    tx_hash: String,
    tx_pos: u32,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct HeaderNotification {
    height: u64,
}

/// Electrum/Fulcrum client with failover support.
pub struct ElectrumClient {
    config: IndexerConfig,
    network: Network,
    timeout_duration: Duration,
    next_id: AtomicU64,
    pending: Arc<PendingMap>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    connected: Arc<AtomicBool>,
    tip_height: Arc<AtomicU64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ElectrumClient {
    pub fn new(config: IndexerConfig, network: Network) -> Self {
        let timeout_duration = Duration::from_secs(config.request_timeout_secs);
        Self {
            config,
            network,
            timeout_duration,
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            outbound: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            tip_height: Arc::new(AtomicU64::new(0)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Last block height announced by the indexer.
    pub fn tip_height(&self) -> u64 {
        self.tip_height.load(Ordering::SeqCst)
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> BlockchainResult<T> {
        let sender = self
            .outbound
            .lock()
            .map_err(|_| BlockchainError::Rpc("Outbound lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| BlockchainError::NotAvailable("indexer disconnected".to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if sender.send(Message::Text(body.to_string().into())).is_err() {
            self.pending.remove(&id);
            return Err(BlockchainError::NotAvailable("indexer disconnected".to_string()));
        }

        let value = match timeout(self.timeout_duration, rx).await {
            Ok(Ok(Ok(value))) => value,
            Ok(Ok(Err(message))) => return Err(BlockchainError::Rpc(format!("{}: {}", method, message))),
            Ok(Err(_)) => {
                return Err(BlockchainError::NotAvailable("connection closed".to_string()))
            }
            Err(_) => {
                self.pending.remove(&id);
                tracing::warn!(method = method, "Indexer request timed out");
                return Err(BlockchainError::Timeout(self.config.request_timeout_secs));
            }
        };

        serde_json::from_value(value)
            .map_err(|e| BlockchainError::Decode(format!("{} response: {}", method, e)))
    }

    async fn current_tip(&self) -> BlockchainResult<u64> {
        let tip = self.tip_height();
        if tip > 0 {
            return Ok(tip);
        }
        let header: HeaderNotification = self.request("blockchain.headers.subscribe", json!([])).await?;
        self.tip_height.store(header.height, Ordering::SeqCst);
        Ok(header.height)
    }

    fn endpoints(&self) -> Vec<String> {
        std::iter::once(self.config.url.clone())
            .chain(self.config.failover_urls.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl LedgerIndexer for ElectrumClient {
    async fn connect(&self) -> BlockchainResult<mpsc::UnboundedReceiver<IndexerEvent>> {
        if self.is_connected() {
            self.disconnect().await;
        }

        for (i, url) in self.endpoints().iter().enumerate() {
            let stream = match timeout(self.timeout_duration, tokio_tungstenite::connect_async(url.as_str())).await {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(e)) => {
                    tracing::warn!(endpoint_idx = i, url = %url, error = %e, "Indexer connect failed, trying next endpoint");
                    continue;
                }
                Err(_) => {
                    tracing::warn!(endpoint_idx = i, url = %url, "Indexer connect timed out, trying next endpoint");
                    continue;
                }
            };

            let (mut sink, mut source) = stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
            let (event_tx, event_rx) = mpsc::unbounded_channel();

            let writer = tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            let pending = self.pending.clone();
            let connected = self.connected.clone();
            let outbound = self.outbound.clone();
            let tip = self.tip_height.clone();
            let reader = tokio::spawn(async move {
                let reason = loop {
                    match source.next().await {
                        Some(Ok(Message::Text(text))) => {
                            dispatch_message(text.as_str(), &pending, &event_tx, &tip);
                        }
                        Some(Ok(Message::Close(_))) | None => break "closed by server".to_string(),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break e.to_string(),
                    }
                };
                connected.store(false, Ordering::SeqCst);
                if let Ok(mut guard) = outbound.lock() {
                    guard.take();
                }
                // Dropping the senders fails every in-flight request.
                pending.clear();
                metrics::record_indexer_connected(false);
                tracing::warn!(reason = %reason, "Indexer connection lost");
                let _ = event_tx.send(IndexerEvent::Disconnected { reason });
            });

            if let Ok(mut guard) = self.outbound.lock() {
                *guard = Some(out_tx);
            }
            if let Ok(mut tasks) = self.tasks.lock() {
                tasks.push(writer);
                tasks.push(reader);
            }
            self.connected.store(true, Ordering::SeqCst);

            let version: BlockchainResult<Value> = self
                .request("server.version", json!([CLIENT_NAME, PROTOCOL_VERSION]))
                .await;
            if let Err(e) = version {
                tracing::warn!(url = %url, error = %e, "Indexer handshake failed");
                self.disconnect().await;
                continue;
            }
            self.tip_height.store(0, Ordering::SeqCst);
            let tip = match self.current_tip().await {
                Ok(tip) => tip,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Indexer header subscription failed");
                    self.disconnect().await;
                    continue;
                }
            };

            metrics::record_indexer_connected(true);
            tracing::info!(url = %url, tip_height = tip, "Indexer connected");
            return Ok(event_rx);
        }

        Err(BlockchainError::Rpc("All indexer endpoints failed".to_string()))
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.outbound.lock() {
            guard.take();
        }
        self.pending.clear();
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
        metrics::record_indexer_connected(false);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe_address(&self, address: &Address) -> BlockchainResult<()> {
        let _status: Value = self
            .request("blockchain.address.subscribe", json!([address.to_cashaddr()]))
            .await?;
        Ok(())
    }

    async fn unsubscribe_address(&self, address: &Address) -> BlockchainResult<()> {
        let _removed: Value = self
            .request("blockchain.address.unsubscribe", json!([address.to_cashaddr()]))
            .await?;
        Ok(())
    }

    async fn address_history(&self, address: &Address) -> BlockchainResult<Vec<AddressTransfer>> {
        let history: Vec<HistoryItem> = self
            .request("blockchain.address.get_history", json!([address.to_cashaddr()]))
            .await?;
        let tip = self.current_tip().await?;

        let mut decoded = Vec::with_capacity(history.len());
        for item in history {
            let raw_hex: String = self
                .request("blockchain.transaction.get", json!([item.tx_hash]))
                .await?;
            let raw = hex::decode(&raw_hex)
                .map_err(|e| BlockchainError::Decode(format!("tx {}: {}", item.tx_hash, e)))?;
            let tx = Transaction::deserialize(&raw)?;
            let (confirmations, block_height) = confirmations_at(item.height, tip);
            decoded.push((
                AddressTransfer {
                    tx_id: item.tx_hash,
                    amount: 0,
                    confirmations,
                    block_height,
                },
                tx,
            ));
        }
        Ok(incoming_transfers(address, decoded))
    }

    async fn list_unspent(&self, address: &Address) -> BlockchainResult<Vec<UnspentOutput>> {
        let items: Vec<UnspentItem> = self
            .request("blockchain.address.listunspent", json!([address.to_cashaddr()]))
            .await?;
        let script = address.locking_script();
        Ok(items
            .into_iter()
            .map(|item| UnspentOutput {
                tx_id: item.tx_hash,
                output_index: item.tx_pos,
                value: item.value,
                script_pubkey: script.clone(),
            })
            .collect())
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> BlockchainResult<String> {
        self.request::<String>("blockchain.transaction.broadcast", json!([hex::encode(raw_tx)]))
            .await
            .map_err(|e| match e {
                BlockchainError::Rpc(msg) => BlockchainError::Broadcast(msg),
                other => other,
            })
    }

    fn name(&self) -> &'static str {
        "electrum"
    }
}

impl std::fmt::Debug for ElectrumClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectrumClient")
            .field("url", &self.config.url)
            .field("network", &self.network)
            .field("timeout_secs", &self.config.request_timeout_secs)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Mempool entries report height 0 or -1.
/// Keep the history entries that pay `address` without spending from it.
///
/// A transaction that spends one of the address's outputs is outgoing even
/// when it pays change back to the address. Spends are recognised by outpoint
/// (funding transaction present in the history) or by the unlock script.
fn incoming_transfers(
    address: &Address,
    history: Vec<(AddressTransfer, Transaction)>,
) -> Vec<AddressTransfer> {
    let script = address.locking_script();
    let owned: HashSet<([u8; 32], u32)> = history
        .iter()
        .flat_map(|(_, tx)| {
            let hash = sha256d(&tx.serialize());
            tx.outputs
                .iter()
                .enumerate()
                .filter(|(_, o)| o.script_pubkey == script)
                .map(move |(i, _)| (hash, i as u32))
        })
        .collect();

    history
        .into_iter()
        .filter_map(|(mut transfer, tx)| {
            let outgoing = tx.inputs.iter().any(|input| {
                owned.contains(&(input.prev_tx_hash, input.prev_index))
                    || address.is_unlocked_by(&input.script_sig)
            });
            if outgoing {
                tracing::debug!(tx_id = %transfer.tx_id, address = %address, "Skipping spend from watched address");
                return None;
            }
            transfer.amount = tx
                .outputs
                .iter()
                .filter(|o| o.script_pubkey == script)
                .map(|o| o.value)
                .sum();
            (transfer.amount > 0).then_some(transfer)
        })
        .collect()
}

fn confirmations_at(height: i64, tip: u64) -> (u32, Option<u64>) {
    if height <= 0 {
        return (0, None);
    }
    let height = height as u64;
    let depth = tip.saturating_sub(height).saturating_add(1);
    (depth.min(u64::from(u32::MAX)) as u32, Some(height))
}

/// Route one inbound frame to a pending request or the event channel.
fn dispatch_message(
    text: &str,
    pending: &PendingMap,
    events: &mpsc::UnboundedSender<IndexerEvent>,
    tip: &AtomicU64,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Discarding malformed indexer frame");
            return;
        }
    };

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        if let Some((_, waiter)) = pending.remove(&id) {
            let outcome = match value.get("error") {
                Some(err) if !err.is_null() => Err(err
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string())),
                _ => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = waiter.send(outcome);
        }
        return;
    }

    let params = value.get("params").cloned().unwrap_or(Value::Null);
    match value.get("method").and_then(Value::as_str) {
        Some("blockchain.address.subscribe") => {
            if let Some(address) = params.get(0).and_then(Value::as_str) {
                let _ = events.send(IndexerEvent::AddressActivity {
                    address: address.to_string(),
                });
            }
        }
        Some("blockchain.headers.subscribe") => {
            if let Some(Ok(header)) = params
                .get(0)
                .cloned()
                .map(serde_json::from_value::<HeaderNotification>)
            {
                tip.store(header.height, Ordering::SeqCst);
                let _ = events.send(IndexerEvent::NewTip {
                    height: header.height,
                });
            }
        }
        Some(other) => tracing::debug!(method = other, "Ignoring indexer notification"),
        None => tracing::debug!("Ignoring indexer frame without id or method"),
    }
}
