// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API of the dispatcher.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /api/v1/health` | Liveness |
//! | `POST /api/v1/executions` | Submit a flow |
//! | `GET /api/v1/executions/{id}` | Execution record |
//! | `GET /api/v1/executions/{id}/events` | Execution event log |
//! | `POST /api/v1/executions/{id}/kill` | Kill an execution |
//! | `POST /api/v1/callbacks/{id}` | Node events pushed by executors |
//! | `GET/POST /api/v1/executors` | List or register executors |
//! | `PUT /api/v1/executors/{id}` | Change an executor's address |
//! | `POST /api/v1/executors/{id}/activate` | Activate an executor |
//! | `POST /api/v1/executors/{id}/deactivate` | Deactivate an executor |
//! | `GET /api/v1/executors/{id}/events` | Executor event log |
//! | `POST /api/v1/triggers` | Start a dependency instance |
//! | `GET/DELETE /api/v1/triggers/{id}` | Inspect or cancel it |
//! | `POST /api/v1/bus/{topic}` | Publish to the message bus |

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use flowgate_core::{
    CoreError, DagNode, Event, Execution, ExecutionOptions, Executor, ExecutorEvent, NodeEvent,
    Status,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

use crate::dependency::{
    DependencyContext, DependencyKind, DependencyRegistry, InstanceRecord, MessageBus,
    PluginError, Props,
};
use crate::error::Error;
use crate::manager::{ExecutionManager, KillOutcome};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Execution and executor operations.
    pub manager: Arc<ExecutionManager>,
    /// Dependency-check plugins.
    pub dependencies: Arc<DependencyRegistry>,
    /// In-process message bus.
    pub bus: MessageBus,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/executions", post(submit_execution))
        .route("/api/v1/executions/{id}", get(get_execution))
        .route("/api/v1/executions/{id}/events", get(execution_events))
        .route("/api/v1/executions/{id}/kill", post(kill_execution))
        .route("/api/v1/callbacks/{id}", post(node_callback))
        .route("/api/v1/executors", get(list_executors).post(register_executor))
        .route("/api/v1/executors/{id}", get(get_executor).put(update_executor))
        .route("/api/v1/executors/{id}/activate", post(activate_executor))
        .route("/api/v1/executors/{id}/deactivate", post(deactivate_executor))
        .route("/api/v1/executors/{id}/events", get(executor_events))
        .route("/api/v1/triggers", post(start_trigger))
        .route("/api/v1/triggers/{id}", get(get_trigger).delete(cancel_trigger))
        .route("/api/v1/bus/{topic}", post(publish))
        .with_state(state)
}

/// Serve the API until `shutdown` flips to `true`.
pub async fn run_http_server(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Dispatcher HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    info!("Dispatcher HTTP server stopped");
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorResponseBody {
    message: String,
}

#[derive(Debug)]
struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }
}

impl From<Error> for HttpError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::InvalidFlow(_) | Error::InvalidRequest(_) | Error::Flow(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Plugin(PluginError::Runtime(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Plugin(_) => StatusCode::BAD_REQUEST,
            Error::ExecutionNotFound(_) | Error::ExecutorNotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyQueued(_) | Error::InvalidState { .. } => StatusCode::CONFLICT,
            Error::Core(CoreError::ValidationError { .. }) => StatusCode::CONFLICT,
            Error::Client(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "request failed");
            return Self {
                status,
                message: "internal server error".to_string(),
            };
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<PluginError> for HttpError {
    fn from(err: PluginError) -> Self {
        Error::Plugin(err).into()
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponseBody {
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, HttpError>;

// ============================================================================
// Executions
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Body of `POST /api/v1/executions`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitExecutionRequest {
    /// Flow name.
    pub flow_id: String,
    /// DAG nodes.
    pub nodes: Vec<DagNode>,
    /// Options.
    #[serde(default)]
    pub options: ExecutionOptions,
}

async fn submit_execution(
    State(state): State<AppState>,
    Json(request): Json<SubmitExecutionRequest>,
) -> Result<(StatusCode, Json<Execution>), HttpError> {
    let execution = state
        .manager
        .submit(&request.flow_id, request.nodes, request.options)
        .await?;
    Ok((StatusCode::CREATED, Json(execution)))
}

async fn get_execution(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Execution> {
    Ok(Json(state.manager.get(id).await?))
}

async fn execution_events(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<Event>> {
    Ok(Json(state.manager.events(id).await?))
}

#[derive(Debug, Deserialize)]
struct UserParams {
    user: Option<String>,
}

impl UserParams {
    fn user(&self) -> &str {
        self.user.as_deref().unwrap_or("anonymous")
    }
}

/// Response of `POST /api/v1/executions/{id}/kill`.
#[derive(Debug, Serialize, Deserialize)]
pub struct KillResponse {
    /// `killed`, `pending` or `already_finished`.
    pub outcome: String,
    /// Status after the request.
    pub status: Status,
}

async fn kill_execution(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<UserParams>,
) -> ApiResult<KillResponse> {
    let outcome = state.manager.kill(id, params.user()).await?;
    let (outcome, status) = match outcome {
        KillOutcome::Killed => ("killed", Status::Killed),
        KillOutcome::Pending => ("pending", state.manager.get(id).await?.status),
        KillOutcome::AlreadyFinished(status) => ("already_finished", status),
    };
    Ok(Json(KillResponse {
        outcome: outcome.to_string(),
        status,
    }))
}

/// Response of `POST /api/v1/callbacks/{id}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackResponse {
    /// Whether the event changed anything.
    pub applied: bool,
    /// Final flow status if the event finished the flow.
    pub finished: Option<Status>,
}

async fn node_callback(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(event): Json<NodeEvent>,
) -> ApiResult<CallbackResponse> {
    if event.execution_id != id {
        return Err(HttpError::bad_request(format!(
            "event is for execution {}, not {}",
            event.execution_id, id
        )));
    }
    let transition = state.manager.apply_node_event(event).await?;
    Ok(Json(CallbackResponse {
        applied: !transition.is_empty(),
        finished: transition.finished(),
    }))
}

// ============================================================================
// Executors
// ============================================================================

/// Body of `POST /api/v1/executors`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterExecutorRequest {
    /// Host name.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Activate immediately.
    #[serde(default)]
    pub active: bool,
    /// Operator.
    #[serde(default)]
    pub user: Option<String>,
}

async fn list_executors(State(state): State<AppState>) -> ApiResult<Vec<Executor>> {
    Ok(Json(state.manager.executors().await?))
}

async fn register_executor(
    State(state): State<AppState>,
    Json(request): Json<RegisterExecutorRequest>,
) -> Result<(StatusCode, Json<Executor>), HttpError> {
    let user = request.user.as_deref().unwrap_or("anonymous");
    let executor = state
        .manager
        .register_executor(&request.host, request.port, request.active, user)
        .await?;
    Ok((StatusCode::CREATED, Json(executor)))
}

async fn get_executor(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Executor> {
    Ok(Json(state.manager.executor(id).await?))
}

/// Body of `PUT /api/v1/executors/{id}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateExecutorRequest {
    /// New host.
    pub host: String,
    /// New port.
    pub port: u16,
    /// Operator.
    #[serde(default)]
    pub user: Option<String>,
}

async fn update_executor(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateExecutorRequest>,
) -> ApiResult<Executor> {
    let user = request.user.as_deref().unwrap_or("anonymous");
    Ok(Json(
        state
            .manager
            .update_executor_address(id, &request.host, request.port, user)
            .await?,
    ))
}

async fn activate_executor(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<UserParams>,
) -> ApiResult<Executor> {
    Ok(Json(
        state
            .manager
            .set_executor_active(id, true, params.user())
            .await?,
    ))
}

async fn deactivate_executor(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<UserParams>,
) -> ApiResult<Executor> {
    Ok(Json(
        state
            .manager
            .set_executor_active(id, false, params.user())
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn executor_events(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(page): Query<PageParams>,
) -> ApiResult<Vec<ExecutorEvent>> {
    let limit = page.limit.unwrap_or(100).min(1000);
    let offset = page.offset.unwrap_or(0);
    Ok(Json(state.manager.executor_events(id, limit, offset).await?))
}

// ============================================================================
// Dependency triggers
// ============================================================================

/// Body of `POST /api/v1/triggers`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartTriggerRequest {
    /// Check to run.
    pub kind: DependencyKind,
    /// Instance configuration.
    #[serde(default)]
    pub instance: Props,
    /// Runtime properties.
    #[serde(default)]
    pub runtime: Props,
}

async fn start_trigger(
    State(state): State<AppState>,
    Json(request): Json<StartTriggerRequest>,
) -> Result<(StatusCode, Json<DependencyContext>), HttpError> {
    let context = state
        .dependencies
        .trigger(request.kind, &request.instance, &request.runtime)?;
    Ok((StatusCode::CREATED, Json(context)))
}

async fn get_trigger(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<InstanceRecord> {
    state
        .dependencies
        .get(id)
        .map(Json)
        .ok_or_else(|| HttpError::not_found(format!("dependency instance {} not found", id)))
}

async fn cancel_trigger(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, HttpError> {
    if state.dependencies.cancel(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(HttpError::not_found(format!(
            "no pending dependency instance {}",
            id
        )))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PublishResponse {
    delivered: usize,
}

async fn publish(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    payload: String,
) -> Json<PublishResponse> {
    Json(PublishResponse {
        delivered: state.bus.publish(topic, payload),
    })
}
