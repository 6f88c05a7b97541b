//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use settlement_engine::blockchain::{HdWallet, Network};
use settlement_engine::notifications::WebhookEndpoint;

pub const TEST_SEED: &str = "000102030405060708090a0b0c0d0e0f";
pub const SECRET: &str = "whsec_test";

/// One request captured by a mock receiver.
#[derive(Debug, Clone)]
pub struct Captured {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Captured {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// A mock webhook receiver answering with a scripted sequence of statuses.
/// The last status repeats once the script runs out.
pub struct MockReceiver {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<Captured>>>,
}

impl MockReceiver {
    pub fn url(&self) -> String {
        format!("http://{}/hooks", self.addr)
    }

    pub fn endpoint(&self) -> WebhookEndpoint {
        WebhookEndpoint {
            url: self.url(),
            secret: SECRET.to_string(),
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn captured(&self) -> Vec<Captured> {
        self.captured.lock().unwrap().clone()
    }
}

pub async fn start_receiver(script: Vec<u16>) -> MockReceiver {
    start_receiver_with_delay(script, Duration::ZERO).await
}

/// Like [`start_receiver`] but waits `delay` before answering.
pub async fn start_receiver_with_delay(script: Vec<u16>, delay: Duration) -> MockReceiver {
    assert!(!script.is_empty());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let captured = Arc::new(Mutex::new(Vec::new()));
    let script = Arc::new(script);

    let (h, c) = (hits.clone(), captured.clone());
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let (h, c, script) = (h.clone(), c.clone(), script.clone());
            tokio::spawn(async move {
                let Some(request) = read_request(socket).await else {
                    return;
                };
                let (mut socket, captured) = request;
                let n = h.fetch_add(1, Ordering::SeqCst);
                c.lock().unwrap().push(captured);
                let status = script[n.min(script.len() - 1)];

                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status,
                    reason(status)
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    MockReceiver {
        addr,
        hits,
        captured,
    }
}

async fn read_request(mut socket: TcpStream) -> Option<(TcpStream, Captured)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let headers: HashMap<String, String> = head
        .lines()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = buf[header_end..].to_vec();
    Some((socket, Captured { headers, body }))
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

pub fn test_wallet() -> HdWallet {
    HdWallet::from_seed_hex(TEST_SEED, Network::Mainnet, 0).unwrap()
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_for<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Minimal Electrum server over WebSocket. Every address gets the same
/// `history` of `(raw tx hex, height)`; transactions are served by txid.
pub async fn start_electrum(tip: u64, history: Vec<(String, i64)>) -> String {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use settlement_engine::blockchain::transaction::Transaction;
    use tokio_tungstenite::tungstenite::Message;

    let entries: Vec<(String, String, i64)> = history
        .into_iter()
        .map(|(raw, height)| {
            let tx = Transaction::deserialize(&hex::decode(&raw).unwrap()).unwrap();
            (tx.tx_id(), raw, height)
        })
        .collect();
    let entries = Arc::new(entries);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let entries = entries.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                let (mut sink, mut source) = ws.split();
                while let Some(Ok(message)) = source.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let request: Value = serde_json::from_str(text.as_str()).unwrap();
                    let result = match request["method"].as_str().unwrap_or_default() {
                        "server.version" => json!(["mock-electrum", "1.4"]),
                        "blockchain.headers.subscribe" => json!({ "height": tip, "hex": "" }),
                        "blockchain.address.subscribe" => Value::Null,
                        "blockchain.address.get_history" => Value::Array(
                            entries
                                .iter()
                                .map(|(id, _, height)| json!({ "tx_hash": id, "height": height }))
                                .collect(),
                        ),
                        "blockchain.transaction.get" => {
                            let wanted = request["params"][0].as_str().unwrap_or_default();
                            entries
                                .iter()
                                .find(|(id, _, _)| id == wanted)
                                .map(|(_, raw, _)| json!(raw))
                                .unwrap_or(Value::Null)
                        }
                        _ => Value::Null,
                    };
                    let response = json!({ "jsonrpc": "2.0", "id": request["id"], "result": result });
                    if sink.send(Message::Text(response.to_string().into())).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    format!("ws://{}", addr)
}
