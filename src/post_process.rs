use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::outcome::CycleOutcome;

/// Error produced by a post-process hook.
#[derive(Debug, thiserror::Error)]
pub enum PostProcessError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("webhook returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("cancelled")]
    Cancelled,
}

/// Receives the report of every cycle, whether or not hosts failed.
#[async_trait]
pub trait PostProcess: Send + Sync {
    async fn post_process(
        &self,
        cancel: &CancellationToken,
        outcome: &CycleOutcome,
    ) -> Result<(), PostProcessError>;
}

/// Logs a one-line summary of the cycle, plus one line per failed host.
#[derive(Debug, Default)]
pub struct SummaryPostProcess;

#[async_trait]
impl PostProcess for SummaryPostProcess {
    async fn post_process(
        &self,
        _cancel: &CancellationToken,
        outcome: &CycleOutcome,
    ) -> Result<(), PostProcessError> {
        info!(
            cycle_id = %outcome.cycle_id,
            changed = outcome.changed.len(),
            failed = outcome.errors.len(),
            dry_run = outcome.dry_run,
            "cycle finished"
        );
        for (host, errors) in &outcome.errors {
            warn!(host = %host, errors = ?errors, "host did not converge");
        }
        Ok(())
    }
}

/// POSTs the cycle report as JSON to a webhook.
pub struct HttpPostProcess {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpPostProcess {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            timeout,
        }
    }

    async fn send(&self, outcome: &CycleOutcome) -> Result<(), PostProcessError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(outcome)
            .send()
            .await
            .map_err(|e| PostProcessError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            info!(cycle_id = %outcome.cycle_id, status, "cycle report delivered");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(PostProcessError::Status { status, body })
    }
}

#[async_trait]
impl PostProcess for HttpPostProcess {
    async fn post_process(
        &self,
        cancel: &CancellationToken,
        outcome: &CycleOutcome,
    ) -> Result<(), PostProcessError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PostProcessError::Cancelled),
            result = self.send(outcome) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostId;
    use std::collections::{BTreeSet, HashMap};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn outcome() -> CycleOutcome {
        let id = HostId::new("H1").unwrap();
        let mut errors = HashMap::new();
        errors.insert(id.clone(), vec!["boom".to_string()]);
        CycleOutcome::build("01J", false, BTreeSet::from([id]), errors, HashMap::new())
    }

    #[tokio::test]
    async fn webhook_receives_outcome_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/report"))
            .and(body_partial_json(serde_json::json!({
                "cycle_id": "01J",
                "changed": ["H1"],
                "errors": {"H1": ["boom"]}
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let hook = HttpPostProcess::new(format!("{}/report", server.uri()), Duration::from_secs(5));
        hook.post_process(&CancellationToken::new(), &outcome())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn webhook_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("nope"))
            .mount(&server)
            .await;

        let hook = HttpPostProcess::new(server.uri(), Duration::from_secs(5));
        let err = hook
            .post_process(&CancellationToken::new(), &outcome())
            .await
            .unwrap_err();
        assert!(matches!(err, PostProcessError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn summary_never_fails() {
        SummaryPostProcess
            .post_process(&CancellationToken::new(), &outcome())
            .await
            .unwrap();
    }
}
