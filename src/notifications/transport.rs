//! HTTP transport for webhook POSTs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

/// Sends one webhook attempt. Returns the HTTP status, or a transport error
/// (connect failure, timeout) as text.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, request: &WebhookRequest, timeout: Duration) -> Result<u16, String>;
}

#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(&self, request: &WebhookRequest, timeout: Duration) -> Result<u16, String> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(timeout)
            .header(CONTENT_TYPE, "application/json")
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                format!("timed out after {}s", timeout.as_secs())
            } else {
                e.to_string()
            }
        })?;
        Ok(response.status().as_u16())
    }
}
