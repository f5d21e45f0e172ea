// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API of the executor node.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /api/v1/executions` | Accept a flow ([`SubmitRequest`] → [`Ack`]) |
//! | `GET /api/v1/executions/{id}/status` | Flow status report |
//! | `POST /api/v1/executions/{id}/cancel` | Kill a flow |
//! | `GET /api/v1/ping` | Health and load |
//!
//! A refused submission is still answered with 200 and `accepted: false`.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use flowgate_core::protocol::{Ack, FlowStatusReport, PingResponse, SubmitRequest};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::Error;
use crate::flow_runner::FlowRunner;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Flows running on this node.
    pub runner: Arc<FlowRunner>,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/executions", post(submit))
        .route("/api/v1/executions/{id}/status", get(status))
        .route("/api/v1/executions/{id}/cancel", post(cancel))
        .route("/api/v1/ping", get(ping))
        .with_state(state)
}

/// Serve the API until `shutdown` resolves.
pub async fn run_http_server(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Executor HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Executor HTTP server stopped");
    Ok(())
}

#[derive(Debug, Serialize)]
struct ErrorResponseBody {
    message: String,
}

#[derive(Debug)]
struct HttpError {
    status: StatusCode,
    message: String,
}

impl From<Error> for HttpError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
            Error::UnknownJobType { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponseBody {
                message: self.message,
            }),
        )
            .into_response()
    }
}

async fn submit(State(state): State<AppState>, Json(request): Json<SubmitRequest>) -> Json<Ack> {
    Json(state.runner.submit(request).await)
}

async fn status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<FlowStatusReport>, HttpError> {
    state
        .runner
        .status(id)
        .await
        .map(Json)
        .ok_or_else(|| Error::ExecutionNotFound(id).into())
}

async fn cancel(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Ack>, HttpError> {
    Ok(Json(state.runner.cancel(id)?))
}

async fn ping(State(state): State<AppState>) -> Json<PingResponse> {
    Json(PingResponse {
        status: "alive".to_string(),
        running_flows: state.runner.running_flows(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_runner::FlowRunnerConfig;
    use crate::jobs::{JobRunnerRegistry, NoopRunner};
    use crate::reporter::HttpReporter;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use flowgate_core::{DagNode, ExecutionOptions, FlowDag, Status};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn app() -> Router {
        let jobs = Arc::new(JobRunnerRegistry::new().register(Arc::new(NoopRunner::new())));
        let reporter = Arc::new(HttpReporter::new(Duration::from_secs(1), 0).unwrap());
        let runner = Arc::new(FlowRunner::new(jobs, reporter, FlowRunnerConfig::default()));
        router(AppState { runner })
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn submission(execution_id: i64, nodes: Vec<DagNode>) -> Value {
        serde_json::to_value(SubmitRequest {
            execution_id,
            flow_id: "nightly-report".to_string(),
            dag: FlowDag::new(nodes).unwrap(),
            options: ExecutionOptions::default(),
            callback_url: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let (status, body) = call(&app(), Method::GET, "/api/v1/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        let ping: PingResponse = serde_json::from_value(body).unwrap();
        assert!(ping.is_alive());
        assert_eq!(ping.running_flows, 0);
    }

    #[tokio::test]
    async fn test_submit_status_and_cancel() {
        let app = app();
        let body = submission(
            11,
            vec![DagNode::new("wait", &[]).with_config("sleep_ms", "10000")],
        );
        let (status, ack) = call(&app, Method::POST, "/api/v1/executions", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["accepted"], true);

        let (status, body) = call(&app, Method::GET, "/api/v1/executions/11/status", None).await;
        assert_eq!(status, StatusCode::OK);
        let report: FlowStatusReport = serde_json::from_value(body).unwrap();
        assert_eq!(report.execution_id, 11);
        assert_eq!(report.status, Status::Running);

        let (status, ack) = call(&app, Method::POST, "/api/v1/executions/11/cancel", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["accepted"], true);

        let mut last = Status::Running;
        for _ in 0..200 {
            let (_, body) = call(&app, Method::GET, "/api/v1/executions/11/status", None).await;
            last = serde_json::from_value::<FlowStatusReport>(body).unwrap().status;
            if last.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(last, Status::Killed);
    }

    #[tokio::test]
    async fn test_unknown_execution_is_not_found() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/api/v1/executions/5/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["message"].as_str().unwrap().contains("not found"));

        let (status, _) = call(&app, Method::POST, "/api/v1/executions/5/cancel", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_refused_submission_is_acknowledged() {
        let body = submission(12, vec![DagNode::new("a", &[]).with_job_type("spark")]);
        let (status, ack) = call(&app(), Method::POST, "/api/v1/executions", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["accepted"], false);
        assert!(ack["message"].as_str().unwrap().contains("spark"));
    }
}
