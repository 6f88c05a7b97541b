//! Merchant webhook endpoint lookup.

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::schema::MerchantConfig;
use crate::notifications::types::NotificationResult;

#[derive(Clone, PartialEq, Eq)]
pub struct WebhookEndpoint {
    pub url: String,
    pub secret: String,
}

impl fmt::Debug for WebhookEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookEndpoint")
            .field("url", &self.url)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Resolves an owner to their webhook endpoint, if they configured one.
#[async_trait]
pub trait MerchantDirectory: Send + Sync {
    async fn webhook_endpoint(&self, owner_id: &str) -> NotificationResult<Option<WebhookEndpoint>>;
}

/// Directory seeded from the `[[merchants]]` config table.
#[derive(Default)]
pub struct StaticMerchantDirectory {
    endpoints: DashMap<String, WebhookEndpoint>,
}

impl StaticMerchantDirectory {
    pub fn from_config(merchants: &[MerchantConfig]) -> Self {
        let directory = Self::default();
        for merchant in merchants {
            directory.upsert(
                &merchant.id,
                WebhookEndpoint {
                    url: merchant.webhook_url.clone(),
                    secret: merchant.webhook_secret.clone(),
                },
            );
        }
        directory
    }

    pub fn upsert(&self, owner_id: &str, endpoint: WebhookEndpoint) {
        self.endpoints.insert(owner_id.to_string(), endpoint);
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[async_trait]
impl MerchantDirectory for StaticMerchantDirectory {
    async fn webhook_endpoint(&self, owner_id: &str) -> NotificationResult<Option<WebhookEndpoint>> {
        Ok(self.endpoints.get(owner_id).map(|e| e.value().clone()))
    }
}
