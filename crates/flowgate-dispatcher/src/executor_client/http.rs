// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP implementation of [`ExecutorClient`].
//!
//! Idempotent calls (`ping`, `get_status`) are retried on transient failures
//! with a fixed backoff. `submit` and `cancel` are attempted once.

use std::time::Duration;

use async_trait::async_trait;
use flowgate_core::Executor;
use flowgate_core::protocol::{Ack, FlowStatusReport, PingResponse, SubmitRequest};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{ClientError, ExecutorClient};

/// Settings for [`HttpExecutorClient`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Extra attempts for idempotent calls.
    pub retries: u32,
    /// Delay between attempts.
    pub retry_backoff: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Talks to executors over their HTTP API.
#[derive(Clone)]
pub struct HttpExecutorClient {
    client: reqwest::Client,
    config: HttpClientConfig,
}

impl HttpExecutorClient {
    /// Build a client.
    pub fn new(config: HttpClientConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(executor: &Executor, path: &str) -> String {
        format!("http://{}:{}{}", executor.host, executor.port, path)
    }

    fn transport_error(executor: &Executor, err: reqwest::Error, timeout: Duration) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout {
                executor: executor.address(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else {
            ClientError::Unreachable {
                executor: executor.address(),
                message: err.to_string(),
            }
        }
    }

    async fn decode<T: DeserializeOwned>(
        executor: &Executor,
        execution_id: Option<i64>,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| ClientError::Decode {
                executor: executor.address(),
                message: e.to_string(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        match (status, execution_id) {
            (StatusCode::NOT_FOUND, Some(execution_id)) => Err(ClientError::NotFound {
                executor: executor.address(),
                execution_id,
            }),
            (s, _) if s.is_server_error() => Err(ClientError::Unreachable {
                executor: executor.address(),
                message: format!("{}: {}", s, body),
            }),
            (s, _) => Err(ClientError::Rejected {
                executor: executor.address(),
                message: format!("{}: {}", s, body),
            }),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        executor: &Executor,
        path: &str,
        execution_id: Option<i64>,
    ) -> Result<T, ClientError> {
        let mut attempt = 0;
        loop {
            let result = match self.client.get(Self::url(executor, path)).send().await {
                Ok(response) => Self::decode(executor, execution_id, response).await,
                Err(e) => Err(Self::transport_error(
                    executor,
                    e,
                    self.config.request_timeout,
                )),
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.config.retries => {
                    attempt += 1;
                    debug!(executor = %executor.address(), attempt, error = %e, "Retrying executor call");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn post_json<B: serde::Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        executor: &Executor,
        path: &str,
        execution_id: Option<i64>,
        body: &B,
    ) -> Result<T, ClientError> {
        let response = self
            .client
            .post(Self::url(executor, path))
            .json(body)
            .send()
            .await
            .map_err(|e| Self::transport_error(executor, e, self.config.request_timeout))?;
        Self::decode(executor, execution_id, response).await
    }
}

#[async_trait]
impl ExecutorClient for HttpExecutorClient {
    async fn submit(
        &self,
        executor: &Executor,
        request: &SubmitRequest,
    ) -> Result<Ack, ClientError> {
        self.post_json(executor, "/api/v1/executions", None, request)
            .await
    }

    async fn get_status(
        &self,
        executor: &Executor,
        execution_id: i64,
    ) -> Result<FlowStatusReport, ClientError> {
        self.get_json(
            executor,
            &format!("/api/v1/executions/{}/status", execution_id),
            Some(execution_id),
        )
        .await
    }

    async fn cancel(&self, executor: &Executor, execution_id: i64) -> Result<Ack, ClientError> {
        self.post_json(
            executor,
            &format!("/api/v1/executions/{}/cancel", execution_id),
            Some(execution_id),
            &serde_json::json!({}),
        )
        .await
    }

    async fn ping(&self, executor: &Executor) -> Result<PingResponse, ClientError> {
        self.get_json(executor, "/api/v1/ping", None).await
    }
}
