//! Job repository.
//!
//! All access to the `job` table. The claim, promotion, and recovery
//! operations are raw SQL because they must be atomic across worker tasks
//! and across node processes; everything else uses the usual entity API.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kazari_common::{AppError, AppResult};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseBackend, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, Statement,
};
use serde::Serialize;
use serde_json::Value as Json;

use crate::entities::job::{self, JobStatus};
use crate::entities::Job;

/// Diagnostics captured when a job fails.
#[derive(Debug, Clone, Default)]
pub struct JobDiagnostics {
    /// Top-level error message.
    pub message: Option<String>,
    /// First underlying cause.
    pub source: Option<String>,
    /// Debug rendering of the error chain.
    pub stack_trace: Option<String>,
    /// Full rendering, or a fixed tag such as `timeout` or `stalled`.
    pub exception: Option<String>,
}

/// Per-status row counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub queued: u64,
    pub delayed: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Job repository for database operations.
#[derive(Clone)]
pub struct JobRepository {
    db: Arc<DatabaseConnection>,
}

impl JobRepository {
    /// Create a new job repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<DatabaseConnection> {
        &self.db
    }

    /// Find a job by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<job::Model>> {
        Job::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Get a job by ID, returning an error if not found.
    pub async fn get_by_id(&self, id: &str) -> AppResult<job::Model> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::JobNotFound(id.to_string()))
    }

    /// Insert a Queued job.
    ///
    /// Returns `false` when a non-terminal job with the same mutex already
    /// exists; the new job is silently coalesced into it.
    pub async fn insert_queued(
        &self,
        id: &str,
        queue: &str,
        data: Json,
        mutex: Option<&str>,
    ) -> AppResult<bool> {
        // ON CONFLICT must name the partial index predicate to match the
        // unique index on (mutex) for non-terminal rows.
        let result = self
            .db
            .execute(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                "INSERT INTO job (id, queue, status, queued_at, retry_count, data, mutex) \
                 VALUES ($1, $2, 'queued', now(), 0, $3, $4) \
                 ON CONFLICT (mutex) WHERE status IN ('queued', 'delayed', 'running') \
                 DO NOTHING",
                [
                    id.into(),
                    queue.into(),
                    data.into(),
                    mutex.map(ToOwned::to_owned).into(),
                ],
            ))
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert a Delayed job due at `delayed_until`.
    pub async fn insert_delayed(
        &self,
        id: &str,
        queue: &str,
        data: Json,
        delayed_until: DateTime<Utc>,
    ) -> AppResult<job::Model> {
        let model = job::ActiveModel {
            id: Set(id.to_string()),
            queue: Set(queue.to_string()),
            status: Set(JobStatus::Delayed),
            queued_at: Set(Utc::now().into()),
            delayed_until: Set(Some(delayed_until.into())),
            retry_count: Set(0),
            data: Set(data),
            ..Default::default()
        };
        model
            .insert(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Atomically claim the next Queued job for a queue, transitioning it to
    /// Running and stamping `started_at`.
    ///
    /// `FOR UPDATE SKIP LOCKED` makes concurrent claims race-free: two
    /// workers (in the same process or on different nodes) can never claim
    /// the same row.
    pub async fn claim_next(&self, queue: &str) -> AppResult<Option<job::Model>> {
        Job::find()
            .from_raw_sql(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                "UPDATE job SET status = 'running', started_at = now() \
                 WHERE id = ( \
                     SELECT id FROM job \
                     WHERE queue = $1 AND status = 'queued' \
                     ORDER BY queued_at, id \
                     FOR UPDATE SKIP LOCKED \
                     LIMIT 1 \
                 ) \
                 RETURNING *",
                [queue.into()],
            ))
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Authoritative count of Queued jobs in a queue.
    pub async fn count_queued(&self, queue: &str) -> AppResult<u64> {
        Job::find()
            .filter(job::Column::Queue.eq(queue))
            .filter(job::Column::Status.eq(JobStatus::Queued))
            .count(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Per-status counts for a queue (admin surface).
    pub async fn counts(&self, queue: &str) -> AppResult<JobCounts> {
        let rows = self
            .db
            .query_all(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                "SELECT status, COUNT(*) AS count FROM job WHERE queue = $1 GROUP BY status",
                [queue.into()],
            ))
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let status: String = row
                .try_get("", "status")
                .map_err(|e| AppError::Database(e.to_string()))?;
            let count: i64 = row
                .try_get("", "count")
                .map_err(|e| AppError::Database(e.to_string()))?;
            let count = count as u64;
            match status.as_str() {
                "queued" => counts.queued = count,
                "delayed" => counts.delayed = count,
                "running" => counts.running = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Mark a job Completed.
    pub async fn mark_completed(&self, id: &str) -> AppResult<job::Model> {
        let job = self.get_by_id(id).await?;
        let mut active: job::ActiveModel = job.into();
        active.status = Set(JobStatus::Completed);
        active.finished_at = Set(Some(Utc::now().into()));
        active
            .update(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Mark a job Delayed until the given time (handler-requested delay).
    pub async fn mark_delayed(&self, id: &str, until: DateTime<Utc>) -> AppResult<job::Model> {
        let job = self.get_by_id(id).await?;
        let mut active: job::ActiveModel = job.into();
        active.status = Set(JobStatus::Delayed);
        active.delayed_until = Set(Some(until.into()));
        active
            .update(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Mark a job Failed with diagnostics.
    pub async fn mark_failed(&self, id: &str, diag: JobDiagnostics) -> AppResult<job::Model> {
        let job = self.get_by_id(id).await?;
        let mut active: job::ActiveModel = job.into();
        active.status = Set(JobStatus::Failed);
        active.finished_at = Set(Some(Utc::now().into()));
        active.exception_message = Set(diag.message);
        active.exception_source = Set(diag.source);
        active.stack_trace = Set(diag.stack_trace);
        active.exception = Set(diag.exception);
        active
            .update(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Promote Delayed jobs whose `delayed_until` has elapsed to Queued.
    ///
    /// Returns the number of promoted jobs.
    pub async fn promote_due(&self, queue: &str) -> AppResult<u64> {
        let result = self
            .db
            .execute(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                "UPDATE job SET status = 'queued', delayed_until = NULL \
                 WHERE queue = $1 AND status = 'delayed' AND delayed_until <= now()",
                [queue.into()],
            ))
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }

    /// The earliest upcoming `delayed_until` for a queue, if any.
    pub async fn next_delayed_at(&self, queue: &str) -> AppResult<Option<DateTime<Utc>>> {
        let next = Job::find()
            .filter(job::Column::Queue.eq(queue))
            .filter(job::Column::Status.eq(JobStatus::Delayed))
            .order_by_asc(job::Column::DelayedUntil)
            .limit(1)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(next
            .and_then(|job| job.delayed_until)
            .map(|at| at.with_timezone(&Utc)))
    }

    /// Reset Running jobs back to Queued.
    ///
    /// With a queue name this is the per-queue startup recovery; with `None`
    /// it is the cross-queue drain run at hard shutdown. Returns the number
    /// of requeued jobs.
    pub async fn requeue_running(&self, queue: Option<&str>) -> AppResult<u64> {
        let stmt = match queue {
            Some(queue) => Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                "UPDATE job SET status = 'queued' WHERE queue = $1 AND status = 'running'",
                [queue.into()],
            ),
            None => Statement::from_string(
                DatabaseBackend::Postgres,
                "UPDATE job SET status = 'queued' WHERE status = 'running'".to_string(),
            ),
        };
        let result = self
            .db
            .execute(stmt)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }

    /// Force-fail Running jobs claimed before `older_than`, tagging them as
    /// stalled. Returns the affected job IDs.
    pub async fn fail_stalled(
        &self,
        queue: &str,
        older_than: DateTime<Utc>,
    ) -> AppResult<Vec<String>> {
        let rows = self
            .db
            .query_all(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                "UPDATE job SET status = 'failed', finished_at = now(), \
                     exception_message = 'Worker stalled', exception = 'stalled' \
                 WHERE queue = $1 AND status = 'running' AND started_at < $2 \
                 RETURNING id",
                [queue.into(), older_than.into()],
            ))
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                row.try_get("", "id")
                    .map_err(|e| AppError::Database(e.to_string()))
            })
            .collect()
    }

    /// Reset a Failed job to Queued for re-execution, incrementing its retry
    /// count and clearing prior diagnostics.
    pub async fn retry(&self, id: &str) -> AppResult<job::Model> {
        let job = self.get_by_id(id).await?;
        if job.status != JobStatus::Failed {
            return Err(AppError::Conflict(format!(
                "Job {id} is not failed (status: {:?})",
                job.status
            )));
        }
        let retry_count = job.retry_count;
        let mut active: job::ActiveModel = job.into();
        active.status = Set(JobStatus::Queued);
        active.finished_at = Set(None);
        active.retry_count = Set(retry_count + 1);
        active.exception_message = Set(None);
        active.exception_source = Set(None);
        active.stack_trace = Set(None);
        active.exception = Set(None);
        active
            .update(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }
}
