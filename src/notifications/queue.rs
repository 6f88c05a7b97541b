//! Notification queue and delivery worker.
//!
//! The reconciler never waits on a webhook: it pushes a request onto an
//! unbounded channel and moves on. The worker spawns one task per delivery,
//! bounded by a semaphore so a slow receiver cannot exhaust the runtime.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Semaphore};

use crate::notifications::dispatcher::Notifier;
use crate::notifications::types::NotificationRequest;

/// Sending half handed to the reconciler.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::UnboundedSender<NotificationRequest>,
}

pub fn notification_queue() -> (NotificationQueue, mpsc::UnboundedReceiver<NotificationRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (NotificationQueue { tx }, rx)
}

impl NotificationQueue {
    /// Queue a notification. Returns false once the worker has stopped.
    pub fn enqueue(&self, owner_id: &str, event_type: &str, payload: Value) -> bool {
        let sent = self
            .tx
            .send(NotificationRequest {
                owner_id: owner_id.to_string(),
                event_type: event_type.to_string(),
                payload,
            })
            .is_ok();
        if !sent {
            tracing::warn!(owner = %owner_id, event_type = %event_type, "Notification worker gone, event dropped");
        }
        sent
    }
}

pub struct NotificationWorker {
    notifier: Arc<Notifier>,
    rx: mpsc::UnboundedReceiver<NotificationRequest>,
    permits: Arc<Semaphore>,
    max_concurrent: u32,
    drain_timeout: Duration,
}

impl NotificationWorker {
    pub fn new(
        notifier: Arc<Notifier>,
        rx: mpsc::UnboundedReceiver<NotificationRequest>,
        max_concurrent: usize,
        drain_timeout: Duration,
    ) -> Self {
        let max_concurrent = u32::try_from(max_concurrent.max(1)).unwrap_or(u32::MAX);
        Self {
            notifier,
            rx,
            permits: Arc::new(Semaphore::new(max_concurrent as usize)),
            max_concurrent,
            drain_timeout,
        }
    }

    /// Run until shutdown, then flush queued requests and wait for in-flight
    /// deliveries, giving up after the drain timeout.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(max_concurrent = self.max_concurrent, "Notification worker started");
        loop {
            tokio::select! {
                request = self.rx.recv() => match request {
                    Some(request) => self.dispatch(request).await,
                    None => break,
                },
                _ = shutdown.recv() => {
                    tracing::info!("Notification worker draining");
                    break;
                }
            }
        }

        self.rx.close();
        let permits = self.permits.clone();
        let max_concurrent = self.max_concurrent;
        let drain_timeout = self.drain_timeout;
        let drain = async {
            while let Some(request) = self.rx.recv().await {
                self.dispatch(request).await;
            }
            let _ = permits.acquire_many(max_concurrent).await;
        };
        if tokio::time::timeout(drain_timeout, drain).await.is_err() {
            tracing::warn!(
                in_flight = max_concurrent as usize - permits.available_permits(),
                "Drain timeout reached, abandoning deliveries"
            );
        }
        tracing::info!("Notification worker stopped");
    }

    async fn dispatch(&self, request: NotificationRequest) {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = notifier
                .deliver(&request.owner_id, &request.event_type, request.payload)
                .await
            {
                tracing::error!(
                    owner = %request.owner_id,
                    event_type = %request.event_type,
                    error = %e,
                    "Notification could not be recorded"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_after_worker_gone() {
        let (queue, rx) = notification_queue();
        assert!(queue.enqueue("m1", "payment.pending", Value::Null));
        drop(rx);
        assert!(!queue.enqueue("m1", "payment.pending", Value::Null));
    }

    #[tokio::test]
    async fn test_requests_arrive_in_order() {
        let (queue, mut rx) = notification_queue();
        queue.enqueue("m1", "payment.pending", Value::Null);
        queue.enqueue("m1", "payment.confirmed", Value::Null);
        assert_eq!(rx.recv().await.unwrap().event_type, "payment.pending");
        assert_eq!(rx.recv().await.unwrap().event_type, "payment.confirmed");
    }
}
