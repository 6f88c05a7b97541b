//! Outbound webhook notifications.
//!
//! # Data Flow
//! ```text
//! reconciler
//!     → queue.rs (NotificationQueue, unbounded channel)
//!     → queue.rs (worker, one task per delivery, semaphore-bounded)
//!     → dispatcher.rs (persist PENDING, sign, POST, fixed-delay retry)
//!     → transport.rs (reqwest)
//!
//! merchants.rs resolves owner → endpoint + secret; signer.rs produces the
//! `sha256=<hex>` signature header.
//! ```
//!
//! Delivery failures never propagate back into reconciliation. They only
//! land in the persisted event's status.

pub mod dispatcher;
pub mod merchants;
pub mod queue;
pub mod signer;
pub mod transport;
pub mod types;

pub use dispatcher::Notifier;
pub use merchants::{MerchantDirectory, StaticMerchantDirectory, WebhookEndpoint};
pub use queue::{notification_queue, NotificationQueue, NotificationWorker};
pub use transport::{HttpTransport, WebhookRequest, WebhookTransport};
pub use types::{
    DeliveryStatus, NotificationError, NotificationEvent, NotificationRequest, NotificationResult,
    TestDelivery,
};
