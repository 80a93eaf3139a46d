use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::inventory::{snapshot_from_document, Inventory, InventoryError, Snapshot};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Fetches the snapshot with `GET <url>`.
///
/// The response body must be a JSON object mapping host id to payload.
/// A bearer token, if configured, is sent in the `authorization` header.
/// Non-2xx responses are errors; nothing is retried here, the next cycle
/// simply fetches again.
pub struct HttpInventory {
    client: Client,
    url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpInventory {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request(&self) -> Result<Snapshot, InventoryError> {
        debug!(url = %self.url, "fetching inventory");
        let mut req = self.client.get(&self.url).timeout(self.timeout);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let response = req
            .send()
            .await
            .map_err(|e| InventoryError::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| InventoryError::Request(format!("failed to read response body: {e}")))?;

        if !(200..300).contains(&status) {
            return Err(InventoryError::Status { status, body });
        }

        let doc: Value =
            serde_json::from_str(&body).map_err(|e| InventoryError::Format(e.to_string()))?;
        let snapshot = snapshot_from_document(doc)?;
        info!(hosts = snapshot.len(), "inventory fetched");
        Ok(snapshot)
    }
}

#[async_trait]
impl Inventory for HttpInventory {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Snapshot, InventoryError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(InventoryError::Cancelled),
            result = self.request() => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostId;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hosts"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"H1": {"name": "a"}})),
            )
            .mount(&server)
            .await;

        let inv = HttpInventory::new(format!("{}/hosts", server.uri()));
        let snapshot = inv.fetch(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            snapshot[&HostId::new("H1").unwrap()],
            serde_json::json!({"name": "a"})
        );
    }

    #[tokio::test]
    async fn sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hosts"))
            .and(header("authorization", "Bearer tok123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let inv = HttpInventory::new(format!("{}/hosts", server.uri())).with_token("tok123");
        let snapshot = inv.fetch(&CancellationToken::new()).await.unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn non_2xx_is_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hosts"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let inv = HttpInventory::new(format!("{}/hosts", server.uri()));
        let err = inv.fetch(&CancellationToken::new()).await.unwrap_err();
        match err {
            InventoryError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "down");
            }
            other => panic!("expected Status, got: {other}"),
        }
    }

    #[tokio::test]
    async fn timeout_is_request_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let inv = HttpInventory::new(format!("{}/slow", server.uri()))
            .with_timeout(Duration::from_millis(200));
        let err = inv.fetch(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, InventoryError::Request(_)), "got: {err}");
    }

    #[tokio::test]
    async fn cancelled_fetch_returns_promptly() {
        let inv = HttpInventory::new("http://10.255.255.1/hosts");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = inv.fetch(&cancel).await.unwrap_err();
        assert!(matches!(err, InventoryError::Cancelled));
    }
}
