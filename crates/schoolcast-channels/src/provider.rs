//! Provider backend client — bulk WhatsApp sends and instance status.
//!
//! Talks to the school backend, which relays to the WhatsApp gateway:
//! - `POST {base}/notifications/bulk-send` — one batch, cursor in `offset`
//! - `GET  {base}/whatsapp/instances/{id}/status` — one instance
//!
//! Transport errors and non-2xx replies map to `Network`, bodies that do not
//! decode map to `Validation`. Deadlines are enforced by the callers.

use async_trait::async_trait;
use schoolcast_core::config::ApiConfig;
use schoolcast_core::error::{Result, SchoolCastError};
use schoolcast_core::traits::{DispatchApi, StatusApi};
use schoolcast_core::types::{DispatchRequest, DispatchResult, StatusReport};
use serde::de::DeserializeOwned;

/// HTTP client for the notification backend.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl ProviderClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &ApiConfig) -> Self {
        Self::new(&config.base_url, config.token.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T> {
        let response = self
            .authorize(request)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| SchoolCastError::Network(format!("{what} request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SchoolCastError::Network(format!("{what} body read failed: {e}")))?;

        if !status.is_success() {
            return Err(SchoolCastError::Network(format!(
                "{what} returned {status}: {}",
                truncate(&body, 200)
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| SchoolCastError::Validation(format!("Invalid {what} response: {e}")))
    }
}

#[async_trait]
impl DispatchApi for ProviderClient {
    async fn dispatch_batch(&self, request: &DispatchRequest) -> Result<DispatchResult> {
        let result: DispatchResult = self
            .send(
                self.client.post(self.url("notifications/bulk-send")).json(request),
                "bulk-send",
            )
            .await?;
        tracing::debug!(
            "WhatsApp bulk-send: offset {} → sent={} failed={} skipped={} has_more={}",
            request.offset,
            result.sent,
            result.failed,
            result.skipped,
            result.has_more
        );
        Ok(result)
    }
}

#[async_trait]
impl StatusApi for ProviderClient {
    async fn fetch_status(&self, resource_id: &str) -> Result<StatusReport> {
        if resource_id.is_empty() || resource_id.contains('/') {
            return Err(SchoolCastError::Validation(format!(
                "invalid instance id '{resource_id}'"
            )));
        }
        let url = self.url(&format!("whatsapp/instances/{resource_id}/status"));
        self.send(self.client.get(url), "instance status").await
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let client = ProviderClient::new("https://school.example/api/", None);
        assert_eq!(client.base_url(), "https://school.example/api");
        assert_eq!(
            client.url("notifications/bulk-send"),
            "https://school.example/api/notifications/bulk-send"
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 200), "short");
    }

    #[tokio::test]
    async fn test_rejects_path_like_instance_ids() {
        let client = ProviderClient::new("http://127.0.0.1:9", None);
        let err = client.fetch_status("../admin").await.unwrap_err();
        assert!(matches!(err, SchoolCastError::Validation(_)));
    }
}
