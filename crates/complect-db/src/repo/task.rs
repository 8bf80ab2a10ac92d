//! Task queue repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use complect_core::{RoutingFilter, Task, TaskId, TaskOutcome, TaskReport, TaskStatus};
use serde_json::{Map, Value, json};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::{DbError, DbResult};

/// Output of a task force-failed by the startup recovery sweep.
pub const RECOVERY_MESSAGE: &str = "Unexpected fail. Please restart task";

pub fn recovery_result() -> Value {
    json!({
        "output": RECOVERY_MESSAGE,
        "success": false,
        "messages": [],
    })
}

/// Drop NUL characters, which PostgreSQL rejects in `text` and `jsonb`.
fn strip_nul(text: &str) -> String {
    text.replace('\0', "")
}

/// `strip_nul` applied to every string and key of a JSON document.
fn strip_nul_json(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(strip_nul(s)),
        Value::Array(items) => Value::Array(items.iter().map(strip_nul_json).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (strip_nul(k), strip_nul_json(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// A task row in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRecord {
    pub task_id: uuid::Uuid,
    pub status: String,
    pub script: String,
    #[sqlx(rename = "type")]
    pub task_type: String,
    pub locked_by: Option<String>,
    pub args: Value,
    pub result: Option<Value>,
    pub errortext: Option<String>,
    pub meta: Value,
    pub extra: Option<Value>,
    pub created: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRecord> for Task {
    type Error = DbError;

    fn try_from(record: TaskRecord) -> DbResult<Task> {
        let status: TaskStatus = record
            .status
            .parse()
            .map_err(|e| DbError::InvalidRow(format!("task {}: {}", record.task_id, e)))?;
        let args = match record.args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(DbError::InvalidRow(format!(
                    "task {}: args must be an object, got {}",
                    record.task_id, other
                )));
            }
        };

        Ok(Task {
            id: TaskId::from_uuid(record.task_id),
            status,
            script: record.script,
            task_type: record.task_type,
            args,
            result: record.result,
            errortext: record.errortext,
            meta: record.meta,
            extra: record.extra,
            locked_by: record.locked_by,
            created: record.created,
            updated: record.updated,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TaskReportRecord {
    id: i64,
    task_id: uuid::Uuid,
    status: String,
    meta: Value,
    created: DateTime<Utc>,
}

impl TryFrom<TaskReportRecord> for TaskReport {
    type Error = DbError;

    fn try_from(record: TaskReportRecord) -> DbResult<TaskReport> {
        let status = record
            .status
            .parse()
            .map_err(|e| DbError::InvalidRow(format!("task report {}: {}", record.id, e)))?;
        Ok(TaskReport {
            id: record.id,
            task_id: TaskId::from_uuid(record.task_id),
            status,
            meta: record.meta,
            created: record.created,
        })
    }
}

/// A task as submitted by a producer.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub script: String,
    pub task_type: String,
    pub args: Map<String, Value>,
    pub meta: Value,
}

impl NewTask {
    pub fn new(
        task_type: impl Into<String>,
        script: impl Into<String>,
        args: Map<String, Value>,
    ) -> Self {
        Self {
            script: script.into(),
            task_type: task_type.into(),
            args,
            meta: json!({}),
        }
    }
}

/// Durable task queue.
///
/// Every status transition appends a `TaskReport` row in the same transaction.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: NewTask) -> DbResult<Task>;

    /// Take the oldest enqueued task of `task_type` matching all filters and
    /// mark it working under `worker`. Concurrent claimers never get the same row.
    async fn claim(
        &self,
        task_type: &str,
        filters: &[RoutingFilter],
        worker: &str,
    ) -> DbResult<Option<Task>>;

    async fn finish(&self, id: TaskId, outcome: &TaskOutcome) -> DbResult<Task>;

    async fn fail(&self, id: TaskId, errortext: &str, result: &Value) -> DbResult<Task>;

    /// Force-fail tasks left working under `worker` by a previous process.
    async fn recover_stale(&self, worker: &str) -> DbResult<Vec<Task>>;

    async fn get(&self, id: TaskId) -> DbResult<Task>;

    async fn reports(&self, id: TaskId) -> DbResult<Vec<TaskReport>>;
}

/// PostgreSQL implementation of TaskQueue.
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn append_reports(conn: &mut PgConnection, ids: &[uuid::Uuid]) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO task_reports (task_id, status, meta, created)
        SELECT task_id, status, meta, NOW() FROM tasks
        WHERE task_id = ANY($1)
        "#,
    )
    .bind(ids)
    .execute(conn)
    .await?;
    Ok(())
}

fn claim_query<'a>(
    task_type: &'a str,
    filters: &'a [RoutingFilter],
    worker: &'a str,
) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new("UPDATE tasks SET status = 'working', locked_by = ");
    builder.push_bind(worker);
    builder.push(
        ", updated = NOW() WHERE task_id = (SELECT task_id FROM tasks WHERE status = 'enqueued' AND type = ",
    );
    builder.push_bind(task_type);
    for filter in filters {
        builder.push(" AND args->>");
        builder.push_bind(filter.key.as_str());
        builder.push(" = ");
        builder.push_bind(filter.value.as_str());
    }
    builder.push(" ORDER BY created ASC FOR UPDATE SKIP LOCKED LIMIT 1) RETURNING *");
    builder
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: NewTask) -> DbResult<Task> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            INSERT INTO tasks (task_id, status, script, type, args, meta, created)
            VALUES ($1, 'enqueued', $2, $3, $4, $5, NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(&task.script)
        .bind(&task.task_type)
        .bind(Value::Object(task.args))
        .bind(task.meta)
        .fetch_one(&mut *tx)
        .await?;

        append_reports(&mut *tx, &[record.task_id]).await?;
        tx.commit().await?;

        record.try_into()
    }

    async fn claim(
        &self,
        task_type: &str,
        filters: &[RoutingFilter],
        worker: &str,
    ) -> DbResult<Option<Task>> {
        let mut tx = self.pool.begin().await?;

        let mut query = claim_query(task_type, filters, worker);
        let record = query
            .build_query_as::<TaskRecord>()
            .fetch_optional(&mut *tx)
            .await?;

        let Some(record) = record else {
            tx.rollback().await?;
            return Ok(None);
        };

        append_reports(&mut *tx, &[record.task_id]).await?;
        tx.commit().await?;

        Ok(Some(record.try_into()?))
    }

    async fn finish(&self, id: TaskId, outcome: &TaskOutcome) -> DbResult<Task> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            UPDATE tasks
            SET status = 'finished', locked_by = NULL, result = $2, extra = $3, updated = NOW()
            WHERE task_id = $1 AND status = 'working'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(strip_nul_json(&outcome.result))
        .bind(outcome.extra.as_ref().map(strip_nul_json))
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("working task {}", id)))?;

        append_reports(&mut *tx, &[record.task_id]).await?;
        tx.commit().await?;

        record.try_into()
    }

    async fn fail(&self, id: TaskId, errortext: &str, result: &Value) -> DbResult<Task> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            UPDATE tasks
            SET status = 'failed', locked_by = NULL, errortext = $2, result = $3, updated = NOW()
            WHERE task_id = $1 AND status = 'working'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(strip_nul(errortext))
        .bind(strip_nul_json(result))
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("working task {}", id)))?;

        append_reports(&mut *tx, &[record.task_id]).await?;
        tx.commit().await?;

        record.try_into()
    }

    async fn recover_stale(&self, worker: &str) -> DbResult<Vec<Task>> {
        let mut tx = self.pool.begin().await?;

        let records = sqlx::query_as::<_, TaskRecord>(
            r#"
            UPDATE tasks
            SET status = 'failed', locked_by = NULL, errortext = $2, result = $3, updated = NOW()
            WHERE status = 'working' AND locked_by = $1
            RETURNING *
            "#,
        )
        .bind(worker)
        .bind(RECOVERY_MESSAGE)
        .bind(recovery_result())
        .fetch_all(&mut *tx)
        .await?;

        if !records.is_empty() {
            debug!(worker, count = records.len(), "Marked stale tasks failed");
            let ids: Vec<uuid::Uuid> = records.iter().map(|r| r.task_id).collect();
            append_reports(&mut *tx, &ids).await?;
        }
        tx.commit().await?;

        records.into_iter().map(Task::try_from).collect()
    }

    async fn get(&self, id: TaskId) -> DbResult<Task> {
        let record = sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE task_id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))?;
        record.try_into()
    }

    async fn reports(&self, id: TaskId) -> DbResult<Vec<TaskReport>> {
        let records = sqlx::query_as::<_, TaskReportRecord>(
            "SELECT * FROM task_reports WHERE task_id = $1 ORDER BY id",
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(TaskReport::try_from).collect()
    }
}
