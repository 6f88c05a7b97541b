//! Webhook delivery against misbehaving receivers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use settlement_engine::config::schema::NotificationConfig;
use settlement_engine::notifications::types::{
    HEADER_DELIVERY, HEADER_EVENT, HEADER_SIGNATURE, PAYMENT_CONFIRMED,
};
use settlement_engine::notifications::{
    DeliveryStatus, HttpTransport, Notifier, StaticMerchantDirectory,
};
use settlement_engine::payments::{MemoryStore, SettlementStore};

mod common;

fn notifier(endpoint_url: Option<String>, config: NotificationConfig) -> (Notifier, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let merchants = StaticMerchantDirectory::default();
    if let Some(url) = endpoint_url {
        merchants.upsert(
            "merchant-1",
            settlement_engine::notifications::WebhookEndpoint {
                url,
                secret: common::SECRET.to_string(),
            },
        );
    }
    let notifier = Notifier::new(
        store.clone(),
        Arc::new(merchants),
        Arc::new(HttpTransport::new()),
        &config,
    );
    (notifier, store)
}

fn fast_retries() -> NotificationConfig {
    NotificationConfig {
        retry_delay_ms: 20,
        request_timeout_secs: 1,
        ..NotificationConfig::default()
    }
}

#[tokio::test]
async fn test_retry_until_receiver_recovers() {
    let receiver = common::start_receiver(vec![503, 500, 200]).await;
    let (notifier, store) = notifier(Some(receiver.url()), fast_retries());

    let event = notifier
        .deliver("merchant-1", PAYMENT_CONFIRMED, json!({"tx_id": "h1", "amount": 50_000}))
        .await
        .unwrap()
        .expect("endpoint configured");

    assert_eq!(event.status, DeliveryStatus::Delivered);
    assert_eq!(event.attempts, 3);
    assert_eq!(receiver.hits(), 3);

    let stored = store.find_notification(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Delivered);
    assert_eq!(stored.last_status_code, Some(200));

    // Every attempt carries the same delivery id and a valid signature.
    for request in receiver.captured() {
        assert_eq!(request.header(HEADER_EVENT), Some(PAYMENT_CONFIRMED));
        assert_eq!(request.header(HEADER_DELIVERY), Some(event.id.to_string().as_str()));
        let signature = request.header(HEADER_SIGNATURE).unwrap();
        assert!(settlement_sdk::verify_signature(common::SECRET, &request.body, signature));
    }
}

#[tokio::test]
async fn test_exhausted_retries_mark_failed() {
    let receiver = common::start_receiver(vec![500]).await;
    let (notifier, store) = notifier(Some(receiver.url()), fast_retries());

    let event = notifier
        .deliver("merchant-1", PAYMENT_CONFIRMED, json!({}))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(event.status, DeliveryStatus::Failed);
    assert_eq!(event.attempts, 3);
    assert_eq!(receiver.hits(), 3);
    let stored = store.find_notification(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Failed);
    assert_eq!(stored.last_status_code, Some(500));
}

#[tokio::test]
async fn test_unreachable_receiver() {
    // Bind then drop to get a port nobody listens on.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let config = NotificationConfig {
        max_attempts: 2,
        ..fast_retries()
    };
    let (notifier, _) = notifier(Some(format!("http://{}/hooks", addr)), config);

    let event = notifier
        .deliver("merchant-1", PAYMENT_CONFIRMED, json!({}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.status, DeliveryStatus::Failed);
    assert_eq!(event.attempts, 2);
    assert_eq!(event.last_status_code, None);
    assert!(event.last_error.is_some());
}

#[tokio::test]
async fn test_slow_receiver_times_out() {
    let receiver =
        common::start_receiver_with_delay(vec![200], Duration::from_millis(1_500)).await;
    let config = NotificationConfig {
        max_attempts: 1,
        ..fast_retries()
    };
    let (notifier, _) = notifier(Some(receiver.url()), config);

    let event = notifier
        .deliver("merchant-1", PAYMENT_CONFIRMED, json!({}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.status, DeliveryStatus::Failed);
    assert!(event.last_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_webhook_test_reports_receiver_status() {
    let receiver = common::start_receiver(vec![404]).await;
    let (notifier, store) = notifier(Some(receiver.url()), fast_retries());

    let result = notifier.send_test("merchant-1").await.unwrap();
    assert!(!result.success);
    assert_eq!(result.status_code, Some(404));
    assert_eq!(receiver.hits(), 1);
    assert_eq!(store.operation_count(), 0);

    let body: serde_json::Value = serde_json::from_slice(&receiver.captured()[0].body).unwrap();
    assert_eq!(body["type"], "webhook.test");
}
