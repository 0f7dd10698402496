//! PostgreSQL implementation of TaskStore
//!
//! Counters are updated with single-statement arithmetic (`num = num + 1`,
//! `done = done + 1`) so concurrent writers never lose an increment and
//! readers never see a counter go backwards. A call's outcome and the
//! counter it moves commit in the same transaction.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::store::*;
use crate::model::{AtomicStatus, SubtaskStatus, TaskStatus};

const TASK_COLUMNS: &str = "id, name, project_name, status, time_added, time_started";
const SUBTASK_COLUMNS: &str = "id, task_id, name, executor_kind, init_params, depends_on, \
                               num, done, retries, status, error_message";
const ATOMIC_COLUMNS: &str = "id, subtask_id, method_name, params, status, error";

/// PostgreSQL implementation of TaskStore
///
/// # Example
///
/// ```ignore
/// use tasklane_durable::PostgresTaskStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/tasklane").await?;
/// let store = PostgresTaskStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and wrap the resulting pool
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(|e| {
            error!("Failed to connect to database: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self))]
    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })?;
        debug!("migrations applied");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_task(&self, name: &str, project_name: &str) -> Result<TaskRecord, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO tasks (name, project_name, status) VALUES ($1, $2, 'generating') \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(name)
        .bind(project_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let task = task_from_row(&row)?;
        debug!(task_id = task.id, %name, "created task");
        Ok(task)
    }

    #[instrument(skip(self))]
    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get task: {}", e);
                StoreError::Database(e.to_string())
            })?;

        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_tasks_by_name(
        &self,
        name: &str,
        include_failed: bool,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE name = $1 AND ($2 OR status <> 'failed') \
             ORDER BY id"
        ))
        .bind(name)
        .bind(include_failed)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find tasks by name: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list tasks: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn set_task_status(&self, task_id: i64, status: TaskStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tasks SET status = $2 WHERE id = $1")
            .bind(task_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to set task status: {}", e);
                StoreError::Database(e.to_string())
            })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        debug!(task_id, %status, "task status changed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_task_started(&self, task_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET time_started = NOW() WHERE id = $1 AND time_started IS NULL",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to mark task started: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_task(task_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::TaskNotFound(task_id)),
        }
    }

    #[instrument(skip(self))]
    async fn delete_task(&self, task_id: i64) -> Result<(), StoreError> {
        // subtasks and subtask_atomics cascade
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete task: {}", e);
                StoreError::Database(e.to_string())
            })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        debug!(task_id, "deleted task");
        Ok(())
    }

    #[instrument(skip(self, subtask), fields(task_id = subtask.task_id, name = %subtask.name))]
    async fn insert_subtask(&self, subtask: NewSubtask) -> Result<SubtaskRecord, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO subtasks (task_id, name, executor_kind, init_params, depends_on, retries, status) \
             SELECT $1, $2, $3, $4, $5, $6, 'queued' WHERE EXISTS (SELECT 1 FROM tasks WHERE id = $1) \
             RETURNING {SUBTASK_COLUMNS}"
        ))
        .bind(subtask.task_id)
        .bind(&subtask.name)
        .bind(&subtask.executor_kind)
        .bind(Value::Array(subtask.init_params))
        .bind(subtask.depends_on)
        .bind(subtask.retries as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert subtask: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::TaskNotFound(subtask.task_id))?;

        subtask_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_subtask(&self, subtask_id: i64) -> Result<Option<SubtaskRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE id = $1"
        ))
        .bind(subtask_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get subtask: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.as_ref().map(subtask_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_subtasks(&self, task_id: i64) -> Result<Vec<SubtaskRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE task_id = $1 ORDER BY id"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list subtasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(subtask_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn pending_subtasks(
        &self,
        task_id: i64,
        limit: usize,
    ) -> Result<Vec<SubtaskRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM subtasks \
             WHERE task_id = $1 AND status IN ('queued', 'running') \
             ORDER BY id LIMIT $2"
        ))
        .bind(task_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch pending subtasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(subtask_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn set_subtask_status(
        &self,
        subtask_id: i64,
        status: SubtaskStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE subtasks SET status = $2 WHERE id = $1")
            .bind(subtask_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to set subtask status: {}", e);
                StoreError::Database(e.to_string())
            })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SubtaskNotFound(subtask_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_subtask_retries(&self, subtask_id: i64, retries: u32) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE subtasks SET retries = $2 WHERE id = $1")
            .bind(subtask_id)
            .bind(retries as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to set subtask retries: {}", e);
                StoreError::Database(e.to_string())
            })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SubtaskNotFound(subtask_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reset_failed_subtasks(&self, task_id: i64, retries: u32) -> Result<u64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE subtask_atomics SET status = 'queued'
            WHERE status = 'failed'
              AND subtask_id IN (SELECT id FROM subtasks WHERE task_id = $1 AND status = 'failed')
            "#,
        )
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE subtasks SET status = 'queued', retries = $2, error_message = NULL
            WHERE task_id = $1 AND status = 'failed'
            "#,
        )
        .bind(task_id)
        .bind(retries as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(task_id, reset = result.rows_affected(), "reset failed subtasks");
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, params))]
    async fn enqueue_atomic(
        &self,
        subtask_id: i64,
        method_name: &str,
        params: Vec<Value>,
    ) -> Result<AtomicRecord, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let result = sqlx::query("UPDATE subtasks SET num = num + 1 WHERE id = $1")
            .bind(subtask_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to bump subtask num: {}", e);
                StoreError::Database(e.to_string())
            })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SubtaskNotFound(subtask_id));
        }

        let row = sqlx::query(&format!(
            "INSERT INTO subtask_atomics (subtask_id, method_name, params, status) \
             VALUES ($1, $2, $3, 'queued') RETURNING {ATOMIC_COLUMNS}"
        ))
        .bind(subtask_id)
        .bind(method_name)
        .bind(Value::Array(params))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to insert atomic: {}", e);
            StoreError::Database(e.to_string())
        })?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        atomic_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn pending_atomics(
        &self,
        subtask_id: i64,
        limit: usize,
    ) -> Result<Vec<AtomicRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ATOMIC_COLUMNS} FROM subtask_atomics \
             WHERE subtask_id = $1 AND status = 'queued' \
             ORDER BY id LIMIT $2"
        ))
        .bind(subtask_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch pending atomics: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(atomic_from_row).collect()
    }

    #[instrument(skip(self, error, message))]
    async fn finish_atomic(
        &self,
        atomic_id: i64,
        status: AtomicStatus,
        error: Option<&str>,
        message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query(
            "UPDATE subtask_atomics SET status = $2, error = $3 \
             WHERE id = $1 AND status <> 'done' RETURNING subtask_id",
        )
        .bind(atomic_id)
        .bind(status.as_str())
        .bind(error)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to finish atomic: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let Some(row) = row else {
            // Already done, or missing
            let exists = sqlx::query("SELECT 1 FROM subtask_atomics WHERE id = $1")
                .bind(atomic_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
            return match exists {
                Some(_) => Ok(false),
                None => Err(StoreError::AtomicNotFound(atomic_id)),
            };
        };
        let subtask_id: i64 = row.get("subtask_id");

        let counted = match (status, message) {
            (AtomicStatus::Done, _) => Some(
                sqlx::query("UPDATE subtasks SET done = done + 1 WHERE id = $1 AND done < num")
                    .bind(subtask_id),
            ),
            (AtomicStatus::Failed, Some(message)) => Some(
                sqlx::query("UPDATE subtasks SET error_message = $2 WHERE id = $1")
                    .bind(subtask_id)
                    .bind(message),
            ),
            _ => None,
        };
        if let Some(query) = counted {
            query.execute(&mut *tx).await.map_err(|e| {
                error!("Failed to update subtask counters: {}", e);
                StoreError::Database(e.to_string())
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn requeue_failed_atomics(&self, subtask_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE subtask_atomics SET status = 'queued' WHERE subtask_id = $1 AND status = 'failed'",
        )
        .bind(subtask_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to requeue failed atomics: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(subtask_id, requeued = result.rows_affected(), "requeued failed atomics");
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn list_atomics(&self, subtask_id: i64) -> Result<Vec<AtomicRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ATOMIC_COLUMNS} FROM subtask_atomics WHERE subtask_id = $1 ORDER BY id"
        ))
        .bind(subtask_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list atomics: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(atomic_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn progress_totals(&self, task_id: i64) -> Result<ProgressTotals, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(num), 0)::BIGINT AS total,
                   COALESCE(SUM(done), 0)::BIGINT AS completed
            FROM subtasks
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to sum progress: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(ProgressTotals {
            total: row.get("total"),
            completed: row.get("completed"),
        })
    }

    #[instrument(skip(self))]
    async fn current_subtask(&self, task_id: i64) -> Result<Option<CurrentSubtask>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT name, status FROM subtasks
            WHERE task_id = $1 AND status <> 'done'
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get current subtask: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.map(|row| {
            let status: String = row.get("status");
            Ok::<_, StoreError>(CurrentSubtask {
                name: row.get("name"),
                status: status.parse()?,
            })
        })
        .transpose()
    }
}

// Helper functions

fn task_from_row(row: &PgRow) -> Result<TaskRecord, StoreError> {
    let status: String = row.get("status");
    Ok(TaskRecord {
        id: row.get("id"),
        name: row.get("name"),
        project_name: row.get("project_name"),
        status: status.parse()?,
        time_added: row.get("time_added"),
        time_started: row.get("time_started"),
    })
}

fn subtask_from_row(row: &PgRow) -> Result<SubtaskRecord, StoreError> {
    let status: String = row.get("status");
    Ok(SubtaskRecord {
        id: row.get("id"),
        task_id: row.get("task_id"),
        name: row.get("name"),
        executor_kind: row.get("executor_kind"),
        init_params: json_array(row.get("init_params"))?,
        depends_on: row.get("depends_on"),
        num: row.get("num"),
        done: row.get("done"),
        retries: row.get::<i32, _>("retries").max(0) as u32,
        status: status.parse()?,
        error_message: row.get("error_message"),
    })
}

fn atomic_from_row(row: &PgRow) -> Result<AtomicRecord, StoreError> {
    let status: String = row.get("status");
    Ok(AtomicRecord {
        id: row.get("id"),
        subtask_id: row.get("subtask_id"),
        method_name: row.get("method_name"),
        params: json_array(row.get("params"))?,
        status: status.parse()?,
        error: row.get("error"),
    })
}

fn json_array(value: Value) -> Result<Vec<Value>, StoreError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(StoreError::Serialization(format!(
            "expected a JSON array, got {}",
            other
        ))),
    }
}
