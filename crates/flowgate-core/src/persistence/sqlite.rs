// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed execution store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::warn;

use super::ExecutionStore;
use crate::dag::FlowDag;
use crate::error::{CoreError, Result};
use crate::events::Event;
use crate::model::{
    Execution, ExecutionOptions, Executor, ExecutorEvent, ExecutorEventType, NewExecution,
};
use crate::status::Status;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const TERMINAL_SQL: &str = "('SUCCEEDED', 'FAILED', 'KILLED')";

const EXECUTION_COLUMNS: &str = "exec_id, flow_id, status, executor_id, flow_data, options, \
     submit_time, start_time, end_time, update_time, dispatch_attempts, update_version, \
     failure_reason";

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    exec_id: i64,
    flow_id: String,
    status: String,
    executor_id: Option<i64>,
    flow_data: Option<String>,
    options: Option<String>,
    submit_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    update_time: DateTime<Utc>,
    dispatch_attempts: i64,
    update_version: i64,
    failure_reason: Option<String>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = CoreError;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        let corrupt = |details: String| CoreError::CorruptRecord {
            record: format!("execution {}", row.exec_id),
            details,
        };

        let status: Status = row.status.parse().map_err(|e| corrupt(format!("{e}")))?;
        let flow_data = row
            .flow_data
            .as_deref()
            .ok_or_else(|| corrupt("missing flow data".to_string()))?;
        let dag: FlowDag =
            serde_json::from_str(flow_data).map_err(|e| corrupt(format!("flow data: {e}")))?;
        let options: ExecutionOptions = match row.options.as_deref() {
            Some(raw) => {
                serde_json::from_str(raw).map_err(|e| corrupt(format!("options: {e}")))?
            }
            None => ExecutionOptions::default(),
        };

        Ok(Execution {
            id: row.exec_id,
            flow_id: row.flow_id,
            dag,
            status,
            executor_id: row.executor_id,
            options,
            submit_time: row.submit_time,
            start_time: row.start_time,
            end_time: row.end_time,
            update_time: row.update_time,
            dispatch_attempts: u32::try_from(row.dispatch_attempts).unwrap_or(u32::MAX),
            update_version: row.update_version,
            failure_reason: row.failure_reason,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutorRow {
    id: i64,
    host: String,
    port: i64,
    active: bool,
    last_seen: Option<DateTime<Utc>>,
}

impl TryFrom<ExecutorRow> for Executor {
    type Error = CoreError;

    fn try_from(row: ExecutorRow) -> Result<Self> {
        let port = u16::try_from(row.port).map_err(|_| CoreError::CorruptRecord {
            record: format!("executor {}", row.id),
            details: format!("port {} out of range", row.port),
        })?;
        Ok(Executor {
            id: row.id,
            host: row.host,
            port,
            active: row.active,
            last_seen: row.last_seen,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutorEventRow {
    executor_id: i64,
    event_type: String,
    event_time: DateTime<Utc>,
    username: String,
    message: String,
}

/// Decode execution rows, skipping the ones that cannot be decoded.
fn decode_lenient(rows: Vec<ExecutionRow>) -> Vec<Execution> {
    rows.into_iter()
        .filter_map(|row| {
            let exec_id = row.exec_id;
            match Execution::try_from(row) {
                Ok(execution) => Some(execution),
                Err(e) => {
                    warn!(execution_id = exec_id, error = %e, "Skipping unreadable execution record");
                    None
                }
            }
        })
        .collect()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// SQLite-backed [`ExecutionStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to {}: {}", url, e),
            })?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open (creating if needed) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_executions(&self, filter: &str) -> Result<Vec<Execution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM execution_flows WHERE {filter} \
             ORDER BY submit_time ASC, exec_id ASC"
        );
        let rows = sqlx::query_as::<_, ExecutionRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(decode_lenient(rows))
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn insert_execution(&self, new: &NewExecution) -> Result<Execution> {
        let now = Utc::now();
        let flow_data = serde_json::to_string(&new.dag)?;
        let options = serde_json::to_string(&new.options)?;

        let (exec_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO execution_flows (flow_id, status, flow_data, options, submit_time, update_time)
            VALUES (?, 'PREPARING', ?, ?, ?, ?)
            RETURNING exec_id
            "#,
        )
        .bind(&new.flow_id)
        .bind(&flow_data)
        .bind(&options)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(Execution {
            id: exec_id,
            flow_id: new.flow_id.clone(),
            dag: new.dag.clone(),
            status: Status::Preparing,
            executor_id: None,
            options: new.options.clone(),
            submit_time: now,
            start_time: None,
            end_time: None,
            update_time: now,
            dispatch_attempts: 0,
            update_version: 0,
            failure_reason: None,
        })
    }

    async fn fetch_by_id(&self, execution_id: i64) -> Result<Option<Execution>> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM execution_flows WHERE exec_id = ?");
        let row = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Execution::try_from).transpose()
    }

    async fn fetch_non_terminal(&self) -> Result<Vec<Execution>> {
        self.fetch_executions(&format!("status NOT IN {TERMINAL_SQL}"))
            .await
    }

    async fn fetch_active(&self) -> Result<Vec<Execution>> {
        self.fetch_executions(&format!(
            "status NOT IN {TERMINAL_SQL} AND NOT (executor_id IS NULL AND status = 'PREPARING')"
        ))
        .await
    }

    async fn fetch_queued(&self) -> Result<Vec<Execution>> {
        self.fetch_executions("status = 'QUEUED' AND executor_id IS NULL")
            .await
    }

    async fn conditional_assign(&self, execution_id: i64, executor_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE execution_flows
            SET executor_id = ?, update_time = ?, update_version = update_version + 1
            WHERE exec_id = ? AND executor_id IS NULL AND status = 'QUEUED'
            "#,
        )
        .bind(executor_id)
        .bind(Utc::now())
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_started(
        &self,
        execution_id: i64,
        executor_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE execution_flows
            SET status = 'RUNNING', start_time = COALESCE(start_time, ?), update_time = ?,
                dispatch_attempts = 0, update_version = update_version + 1
            WHERE exec_id = ? AND executor_id = ? AND status = 'QUEUED'
            "#,
        )
        .bind(at)
        .bind(Utc::now())
        .bind(execution_id)
        .bind(executor_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn unassign(
        &self,
        execution_id: i64,
        executor_id: i64,
        dag: Option<&FlowDag>,
    ) -> Result<bool> {
        let flow_data = dag.map(serde_json::to_string).transpose()?;
        let sql = format!(
            "UPDATE execution_flows \
             SET executor_id = NULL, status = 'QUEUED', start_time = NULL, \
                 flow_data = COALESCE(?, flow_data), update_time = ?, \
                 update_version = update_version + 1 \
             WHERE exec_id = ? AND executor_id = ? AND status NOT IN {TERMINAL_SQL}"
        );
        let result = sqlx::query(&sql)
            .bind(flow_data)
            .bind(Utc::now())
            .bind(execution_id)
            .bind(executor_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_status(&self, execution_id: i64, from: &[Status], to: Status) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE execution_flows \
             SET status = ?, update_time = ?, update_version = update_version + 1 \
             WHERE exec_id = ? AND status IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(Utc::now())
            .bind(execution_id);
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool).await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_flow_data(&self, execution_id: i64, dag: &FlowDag) -> Result<bool> {
        let flow_data = serde_json::to_string(dag)?;
        let sql = format!(
            "UPDATE execution_flows \
             SET flow_data = ?, update_time = ?, update_version = update_version + 1 \
             WHERE exec_id = ? AND status NOT IN {TERMINAL_SQL}"
        );
        let result = sqlx::query(&sql)
            .bind(flow_data)
            .bind(Utc::now())
            .bind(execution_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_dispatch_failure(&self, execution_id: i64) -> Result<u32> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE execution_flows
            SET dispatch_attempts = dispatch_attempts + 1, update_time = ?,
                update_version = update_version + 1
            WHERE exec_id = ?
            RETURNING dispatch_attempts
            "#,
        )
        .bind(Utc::now())
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((attempts,)) => Ok(u32::try_from(attempts).unwrap_or(u32::MAX)),
            None => Err(CoreError::ExecutionNotFound { execution_id }),
        }
    }

    async fn finalize(
        &self,
        execution_id: i64,
        status: Status,
        ended_at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("{} is not a terminal status", status),
            });
        }
        let sql = format!(
            "UPDATE execution_flows \
             SET status = ?, end_time = ?, failure_reason = COALESCE(?, failure_reason), \
                 update_time = ?, update_version = update_version + 1 \
             WHERE exec_id = ? AND status NOT IN {TERMINAL_SQL}"
        );
        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(ended_at)
            .bind(reason)
            .bind(Utc::now())
            .bind(execution_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn register_executor(&self, host: &str, port: u16, active: bool) -> Result<Executor> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO executors (host, port, active)
            VALUES (?, ?, ?)
            ON CONFLICT (host, port) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(host)
        .bind(i64::from(port))
        .bind(active)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((id,)) => Ok(Executor {
                id,
                host: host.to_string(),
                port,
                active,
                last_seen: None,
            }),
            None => Err(CoreError::ValidationError {
                field: "executor".to_string(),
                message: format!("executor {}:{} already registered", host, port),
            }),
        }
    }

    async fn fetch_executor(&self, executor_id: i64) -> Result<Option<Executor>> {
        let row = sqlx::query_as::<_, ExecutorRow>(
            "SELECT id, host, port, active, last_seen FROM executors WHERE id = ?",
        )
        .bind(executor_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Executor::try_from).transpose()
    }

    async fn fetch_executor_by_address(&self, host: &str, port: u16) -> Result<Option<Executor>> {
        let row = sqlx::query_as::<_, ExecutorRow>(
            "SELECT id, host, port, active, last_seen FROM executors WHERE host = ? AND port = ?",
        )
        .bind(host)
        .bind(i64::from(port))
        .fetch_optional(&self.pool)
        .await?;
        row.map(Executor::try_from).transpose()
    }

    async fn list_executors(&self) -> Result<Vec<Executor>> {
        let rows = sqlx::query_as::<_, ExecutorRow>(
            "SELECT id, host, port, active, last_seen FROM executors ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Executor::try_from).collect()
    }

    async fn update_executor_address(
        &self,
        executor_id: i64,
        host: &str,
        port: u16,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE executors SET host = ?, port = ? WHERE id = ?")
            .bind(host)
            .bind(i64::from(port))
            .bind(executor_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_executor_active(&self, executor_id: i64, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE executors SET active = ? WHERE id = ? AND active != ?")
            .bind(active)
            .bind(executor_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_executor(&self, executor_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE executors SET last_seen = ? WHERE id = ?")
            .bind(at)
            .bind(executor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn post_executor_event(&self, event: &ExecutorEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executor_events (executor_id, event_type, event_time, username, message)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.executor_id)
        .bind(event.event_type.as_str())
        .bind(event.event_time)
        .bind(&event.user)
        .bind(&event.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn executor_events(
        &self,
        executor_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ExecutorEvent>> {
        let rows = sqlx::query_as::<_, ExecutorEventRow>(
            r#"
            SELECT executor_id, event_type, event_time, username, message
            FROM executor_events
            WHERE executor_id = ?
            ORDER BY event_time ASC, id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(executor_id)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let event_type = ExecutorEventType::parse(&row.event_type).ok_or_else(|| {
                    CoreError::CorruptRecord {
                        record: format!("executor event for {}", row.executor_id),
                        details: format!("unknown event type '{}'", row.event_type),
                    }
                })?;
                Ok(ExecutorEvent {
                    executor_id: row.executor_id,
                    event_type,
                    event_time: row.event_time,
                    user: row.username,
                    message: row.message,
                })
            })
            .collect()
    }

    async fn append_event(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        sqlx::query(
            r#"
            INSERT INTO execution_events (exec_id, event_type, event_time, payload)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(event.execution_id())
        .bind(event.label())
        .bind(event.at())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_for(&self, execution_id: i64) -> Result<Vec<Event>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT payload FROM execution_events WHERE exec_id = ? ORDER BY id ASC")
                .bind(execution_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(payload,)| serde_json::from_str(&payload).map_err(CoreError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::DagNode;
    use crate::status::NodeStatus;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        let store = SqliteStore::new(pool);
        store.migrate().await.expect("Failed to run migrations");
        store
    }

    fn new_execution(flow: &str) -> NewExecution {
        NewExecution {
            flow_id: flow.to_string(),
            dag: FlowDag::new(vec![DagNode::new("a", &[]), DagNode::new("b", &["a"])]).unwrap(),
            options: ExecutionOptions::default(),
        }
    }

    async fn queued(store: &SqliteStore) -> Execution {
        let exec = store.insert_execution(&new_execution("etl")).await.unwrap();
        assert!(
            store
                .update_status(exec.id, &[Status::Preparing], Status::Queued)
                .await
                .unwrap()
        );
        exec
    }

    #[tokio::test]
    async fn test_insert_and_fetch() {
        let store = store().await;
        let first = store.insert_execution(&new_execution("etl")).await.unwrap();
        let second = store.insert_execution(&new_execution("etl")).await.unwrap();
        assert!(second.id > first.id);

        let fetched = store.fetch_by_id(first.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, Status::Preparing);
        assert_eq!(fetched.dag, first.dag);
        assert_eq!(fetched.executor_id, None);
        assert!(store.fetch_by_id(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conditional_assign_single_winner() {
        let store = store().await;
        let exec = queued(&store).await;
        let e1 = store.register_executor("h1", 1, true).await.unwrap();
        let e2 = store.register_executor("h2", 2, true).await.unwrap();

        assert!(store.conditional_assign(exec.id, e1.id).await.unwrap());
        assert!(!store.conditional_assign(exec.id, e2.id).await.unwrap());

        let fetched = store.fetch_by_id(exec.id).await.unwrap().unwrap();
        assert_eq!(fetched.executor_id, Some(e1.id));
        assert!(fetched.update_version > exec.update_version);
    }

    #[tokio::test]
    async fn test_unassign_requires_current_executor() {
        let store = store().await;
        let exec = queued(&store).await;
        let e1 = store.register_executor("h1", 1, true).await.unwrap();
        store.conditional_assign(exec.id, e1.id).await.unwrap();
        assert!(
            store
                .mark_started(exec.id, e1.id, Utc::now())
                .await
                .unwrap()
        );

        assert!(!store.unassign(exec.id, e1.id + 1, None).await.unwrap());
        assert!(store.unassign(exec.id, e1.id, None).await.unwrap());

        let fetched = store.fetch_by_id(exec.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, Status::Queued);
        assert_eq!(fetched.executor_id, None);
        assert_eq!(fetched.start_time, None);
    }

    #[tokio::test]
    async fn test_finalize_only_once() {
        let store = store().await;
        let exec = queued(&store).await;

        assert!(
            store
                .finalize(exec.id, Status::Failed, Utc::now(), Some("dispatch failure"))
                .await
                .unwrap()
        );
        assert!(
            !store
                .finalize(exec.id, Status::Succeeded, Utc::now(), None)
                .await
                .unwrap()
        );

        let fetched = store.fetch_by_id(exec.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, Status::Failed);
        assert_eq!(fetched.failure_reason.as_deref(), Some("dispatch failure"));
        assert!(fetched.end_time.is_some());

        // Terminal rows are no longer updatable.
        let mut dag = fetched.dag.clone();
        dag.reset_for_resume();
        assert!(!store.update_flow_data(exec.id, &dag).await.unwrap());
        assert!(store.fetch_non_terminal().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_excludes_unassigned_preparing() {
        let store = store().await;
        let preparing = store.insert_execution(&new_execution("a")).await.unwrap();
        let queued = queued(&store).await;

        let non_terminal: Vec<i64> = store
            .fetch_non_terminal()
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(non_terminal, vec![preparing.id, queued.id]);

        let active: Vec<i64> = store
            .fetch_active()
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(active, vec![queued.id]);
    }

    #[tokio::test]
    async fn test_corrupt_rows_are_skipped_in_listings() {
        let store = store().await;
        let good = queued(&store).await;
        let bad = queued(&store).await;
        sqlx::query("UPDATE execution_flows SET flow_data = 'not json' WHERE exec_id = ?")
            .bind(bad.id)
            .execute(store.pool())
            .await
            .unwrap();

        let rows = store.fetch_non_terminal().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, good.id);

        let err = store.fetch_by_id(bad.id).await.unwrap_err();
        assert_eq!(err.error_code(), "CORRUPT_RECORD");
    }

    #[tokio::test]
    async fn test_dispatch_failures_accumulate() {
        let store = store().await;
        let exec = queued(&store).await;
        assert_eq!(store.record_dispatch_failure(exec.id).await.unwrap(), 1);
        assert_eq!(store.record_dispatch_failure(exec.id).await.unwrap(), 2);
        assert!(store.record_dispatch_failure(12345).await.is_err());
    }

    #[tokio::test]
    async fn test_start_resets_dispatch_failures() {
        let store = store().await;
        let exec = queued(&store).await;
        let e1 = store.register_executor("h1", 1, true).await.unwrap();
        store.record_dispatch_failure(exec.id).await.unwrap();
        store.record_dispatch_failure(exec.id).await.unwrap();

        store.conditional_assign(exec.id, e1.id).await.unwrap();
        assert!(store.mark_started(exec.id, e1.id, Utc::now()).await.unwrap());
        let fetched = store.fetch_by_id(exec.id).await.unwrap().unwrap();
        assert_eq!(fetched.dispatch_attempts, 0);
        assert_eq!(store.record_dispatch_failure(exec.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_executor_registration_and_events() {
        let store = store().await;
        let executor = store.register_executor("worker-1", 12321, false).await.unwrap();
        assert!(store.register_executor("worker-1", 12321, true).await.is_err());

        assert!(store.set_executor_active(executor.id, true).await.unwrap());
        assert!(!store.set_executor_active(executor.id, true).await.unwrap());

        for (kind, message) in [
            (ExecutorEventType::Created, "registered"),
            (ExecutorEventType::Activation, "activated"),
        ] {
            store
                .post_executor_event(&ExecutorEvent {
                    executor_id: executor.id,
                    event_type: kind,
                    event_time: Utc::now(),
                    user: "admin".to_string(),
                    message: message.to_string(),
                })
                .await
                .unwrap();
        }

        let events = store.executor_events(executor.id, 10, 0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, ExecutorEventType::Created);
        let paged = store.executor_events(executor.id, 10, 1).await.unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].message, "activated");

        let found = store
            .fetch_executor_by_address("worker-1", 12321)
            .await
            .unwrap()
            .unwrap();
        assert!(found.active);
    }

    #[tokio::test]
    async fn test_event_log_round_trip() {
        let store = store().await;
        let exec = queued(&store).await;
        let event = Event::Node(crate::events::NodeEvent::new(
            exec.id,
            "a",
            NodeStatus::Running,
        ));
        store.append_event(&event).await.unwrap();

        let events = store.events_for(exec.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label(), "node:a:RUNNING");
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flowgate.db");
        let store = SqliteStore::from_path(&path).await.unwrap();
        store.insert_execution(&new_execution("x")).await.unwrap();
        assert!(path.exists());
    }
}
