// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node event delivery to the dispatcher.
//!
//! Events of one flow are reported in the order they happened; the flow
//! runner awaits each report before sending the next. The dispatcher
//! reconciles anything lost here by polling the flow status.

use std::time::Duration;

use async_trait::async_trait;
use flowgate_core::NodeEvent;
use tracing::{debug, warn};

/// Callback delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// Network failure or timeout.
    #[error("callback transport error: {0}")]
    Transport(String),
    /// The dispatcher answered with a non-success status.
    #[error("callback rejected with {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
}

/// Sends node events to a callback URL.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Deliver one event.
    async fn report(&self, callback_url: &str, event: &NodeEvent) -> Result<(), ReportError>;
}

/// Posts events as JSON.
///
/// Transport errors and 5xx answers are retried with a fixed backoff.
/// 4xx answers are final.
#[derive(Clone)]
pub struct HttpReporter {
    client: reqwest::Client,
    retries: u32,
    retry_backoff: Duration,
}

impl HttpReporter {
    /// Build a reporter.
    pub fn new(timeout: Duration, retries: u32) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            retries,
            retry_backoff: Duration::from_millis(500),
        })
    }

    /// Override the delay between attempts.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    async fn post_once(&self, callback_url: &str, event: &NodeEvent) -> Result<(), ReportError> {
        let response = self
            .client
            .post(callback_url)
            .json(event)
            .send()
            .await
            .map_err(|e| ReportError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ReportError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Reporter for HttpReporter {
    async fn report(&self, callback_url: &str, event: &NodeEvent) -> Result<(), ReportError> {
        let mut attempt = 0;
        loop {
            match self.post_once(callback_url, event).await {
                Ok(()) => {
                    debug!(
                        execution_id = event.execution_id,
                        job_id = %event.job_id,
                        status = %event.status,
                        "Node event reported"
                    );
                    return Ok(());
                }
                Err(e) if is_retryable(&e) && attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        execution_id = event.execution_id,
                        attempt,
                        error = %e,
                        "Retrying callback"
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_retryable(err: &ReportError) -> bool {
    match err {
        ReportError::Transport(_) => true,
        ReportError::Rejected { status, .. } => *status >= 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::NodeStatus;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reporter() -> HttpReporter {
        HttpReporter::new(Duration::from_secs(5), 2)
            .unwrap()
            .with_retry_backoff(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_report_posts_event() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/callbacks/5"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/api/v1/callbacks/5", mock_server.uri());
        reporter()
            .report(&url, &NodeEvent::new(5, "extract", NodeStatus::Running))
            .await
            .unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        let event: NodeEvent = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(event.job_id, "extract");
        assert_eq!(event.status, NodeStatus::Running);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&mock_server)
            .await;

        let url = format!("{}/api/v1/callbacks/5", mock_server.uri());
        let err = reporter()
            .report(&url, &NodeEvent::new(5, "extract", NodeStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::Rejected { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_client_errors_are_final() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad event"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/api/v1/callbacks/5", mock_server.uri());
        let err = reporter()
            .report(&url, &NodeEvent::new(5, "extract", NodeStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::Rejected { status: 400, ref body } if body == "bad event"));
    }
}
