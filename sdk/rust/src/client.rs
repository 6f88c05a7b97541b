use reqwest::Client;
use serde_json::{json, Value};

/// Client for the engine's operator API.
pub struct AdminClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AdminClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub async fn status(&self) -> Result<Value, Box<dyn std::error::Error>> {
        self.get("/admin/status").await
    }

    pub async fn transaction(&self, tx_id: &str) -> Result<Value, Box<dyn std::error::Error>> {
        self.get(&format!("/admin/transactions/{}", tx_id)).await
    }

    pub async fn notification(&self, id: &str) -> Result<Value, Box<dyn std::error::Error>> {
        self.get(&format!("/admin/notifications/{}", id)).await
    }

    /// Create a payment link on a freshly derived address.
    pub async fn create_payment_link(
        &self,
        owner_id: &str,
        kind: &str,
        amount: Option<u64>,
    ) -> Result<Value, Box<dyn std::error::Error>> {
        self.post(
            "/admin/payment-links",
            Some(json!({ "owner_id": owner_id, "kind": kind, "amount": amount })),
        )
        .await
    }

    pub async fn webhook_test(&self, owner_id: &str) -> Result<Value, Box<dyn std::error::Error>> {
        self.post(&format!("/admin/merchants/{}/webhook-test", owner_id), None)
            .await
    }

    async fn get(&self, path: &str) -> Result<Value, Box<dyn std::error::Error>> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn post(&self, path: &str, body: Option<Value>) -> Result<Value, Box<dyn std::error::Error>> {
        let mut req = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key);
        if let Some(body) = body {
            req = req.json(&body);
        }
        Self::decode(req.send().await?).await
    }

    async fn decode(resp: reqwest::Response) -> Result<Value, Box<dyn std::error::Error>> {
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(format!("Engine returned error status {}: {}", status, text).into());
        }
        Ok(serde_json::from_str(&text)?)
    }
}
