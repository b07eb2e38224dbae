//! Queue engine.
//!
//! One [`JobQueue`] instance per named queue. Each instance owns its own
//! concurrency limiter and wake signals; the orchestrator owns the
//! collection of instances, never process-wide state.
//!
//! Delivery is at-least-once: interrupted jobs are requeued on restart, so
//! handlers must be idempotent or rely on the `mutex` deduplication token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use kazari_common::{AppError, AppResult, IdGenerator};
use kazari_db::entities::job;
use kazari_db::repositories::{JobDiagnostics, JobRepository};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on how long the scheduler waits for a "job queued" signal.
/// Wake signals only reach the local process; polling picks up rows written
/// by other nodes.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on the promoter's sleep, for the same cross-node reason.
const PROMOTER_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Backoff after an infrastructure error before the loop retries.
const LOOP_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// What a handler asks the engine to do with the job it just ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCompletion {
    /// The job finished; mark it Completed.
    Done,
    /// Re-delay the job until `delay_until`. Requesting a delay without a
    /// resume time is a defect and fails the job.
    Retry {
        /// When the job becomes due again.
        delay_until: Option<DateTime<Utc>>,
    },
}

/// A registered job handler.
///
/// Receives the job row, the deserialized payload, and a cancellation token
/// that fires on hard shutdown. Errors never escape the worker; they are
/// converted into a terminal Failed state with diagnostics.
pub type JobHandler<T> = Arc<
    dyn Fn(job::Model, T, CancellationToken) -> BoxFuture<'static, anyhow::Result<JobCompletion>>
        + Send
        + Sync,
>;

/// Static configuration for one named queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    /// Queue name; doubles as the `queue` column value.
    pub name: &'static str,
    /// Maximum number of simultaneously running jobs.
    pub concurrency: usize,
    /// Per-job execution timeout.
    pub timeout: Duration,
}

/// Durable, best-effort-FIFO executor for one named queue.
pub struct JobQueue<T> {
    options: QueueOptions,
    repo: JobRepository,
    id_gen: IdGenerator,
    semaphore: Arc<Semaphore>,
    job_queued: Arc<Notify>,
    job_delayed: Arc<Notify>,
    handler: JobHandler<T>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            options: self.options,
            repo: self.repo.clone(),
            id_gen: self.id_gen.clone(),
            semaphore: self.semaphore.clone(),
            job_queued: self.job_queued.clone(),
            job_delayed: self.job_delayed.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<T> JobQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a queue with its handler.
    #[must_use]
    pub fn new(options: QueueOptions, repo: JobRepository, handler: JobHandler<T>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(options.concurrency)),
            job_queued: Arc::new(Notify::new()),
            job_delayed: Arc::new(Notify::new()),
            id_gen: IdGenerator::new(),
            options,
            repo,
            handler,
        }
    }

    /// Insert a Queued job and wake the scheduler.
    ///
    /// Returns `None` when `mutex` matched an existing non-terminal job and
    /// the enqueue was coalesced into it.
    pub async fn enqueue(&self, payload: &T, mutex: Option<&str>) -> AppResult<Option<String>> {
        let data = serde_json::to_value(payload)?;
        let id = self.id_gen.generate();
        let inserted = self
            .repo
            .insert_queued(&id, self.options.name, data, mutex)
            .await?;
        if inserted {
            self.job_queued.notify_one();
            debug!(queue = self.options.name, job_id = %id, "Job queued");
            Ok(Some(id))
        } else {
            debug!(queue = self.options.name, mutex, "Duplicate job coalesced by mutex");
            Ok(None)
        }
    }

    /// Insert a Delayed job due at `run_at` and wake the promoter.
    pub async fn schedule(&self, payload: &T, run_at: DateTime<Utc>) -> AppResult<String> {
        let data = serde_json::to_value(payload)?;
        let id = self.id_gen.generate();
        self.repo
            .insert_delayed(&id, self.options.name, data, run_at)
            .await?;
        self.job_delayed.notify_one();
        debug!(queue = self.options.name, job_id = %id, run_at = %run_at, "Job delayed");
        Ok(id)
    }

    /// Scheduler loop: claims and runs Queued jobs with bounded parallelism
    /// until soft stop.
    async fn run_scheduler(&self, soft: &CancellationToken, hard: &CancellationToken) {
        let name = self.options.name;
        info!(
            queue = name,
            concurrency = self.options.concurrency,
            timeout_secs = self.options.timeout.as_secs(),
            "Queue scheduler started"
        );
        while !soft.is_cancelled() {
            if let Err(e) = self.tick(soft, hard).await {
                error!(queue = name, error = %e, "Queue scheduler iteration failed");
                tokio::select! {
                    () = tokio::time::sleep(LOOP_ERROR_BACKOFF) => {}
                    () = soft.cancelled() => {}
                }
            }
        }
        info!(queue = name, "Queue scheduler stopped");
    }

    /// One scheduler iteration.
    ///
    /// The Queued count is re-read from storage every pass; cached counts
    /// race with the gap between "slot freed" and "job queued" signals.
    async fn tick(&self, soft: &CancellationToken, hard: &CancellationToken) -> AppResult<()> {
        let queued = self.repo.count_queued(self.options.name).await?;
        let free = self.semaphore.available_permits();
        let launchable = (free as u64).min(queued);

        if launchable == 0 {
            if free == 0 {
                // Backlog may exist but every slot is busy: wait for a slot
                // to free up, an early-wake signal, or shutdown.
                tokio::select! {
                    permit = self.semaphore.clone().acquire_owned() => drop(permit),
                    () = self.job_queued.notified() => {}
                    () = soft.cancelled() => {}
                }
            } else {
                // Idle slots but no backlog: wait for a new job (or poll, to
                // notice rows enqueued by other nodes).
                tokio::select! {
                    () = self.job_queued.notified() => {}
                    () = tokio::time::sleep(QUEUE_POLL_INTERVAL) => {}
                    () = soft.cancelled() => {}
                }
            }
            return Ok(());
        }

        for _ in 0..launchable {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };
            // Atomic claim-and-lock; a concurrent worker or node may win the
            // race, in which case there is simply nothing left to claim.
            match self.repo.claim_next(self.options.name).await? {
                Some(claimed) => {
                    let queue = self.clone();
                    let hard = hard.clone();
                    tokio::spawn(async move {
                        queue.process(claimed, &hard).await;
                        drop(permit);
                    });
                }
                None => {
                    drop(permit);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Run one claimed job to a terminal or re-delayed state.
    ///
    /// The final state is persisted before the concurrency slot is released
    /// (the caller drops the permit only after this returns).
    async fn process(&self, claimed: job::Model, hard: &CancellationToken) {
        let name = self.options.name;
        let job_id = claimed.id.clone();

        let payload: T = match serde_json::from_value(claimed.data.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                // Undeserializable payloads can never succeed; fail
                // immediately without retry.
                warn!(queue = name, job_id = %job_id, error = %e, "Job payload deserialization failed");
                self.persist_failure(
                    &job_id,
                    JobDiagnostics {
                        message: Some(format!("Payload deserialization failed: {e}")),
                        exception: Some("deserialization".to_string()),
                        ..Default::default()
                    },
                )
                .await;
                return;
            }
        };

        let cancel = hard.child_token();
        let outcome = tokio::select! {
            // Once the hard stop fires, abandon even if the handler is also
            // ready: the row stays Running and the shutdown path bulk-resets
            // it to Queued for re-execution after restart.
            biased;
            () = hard.cancelled() => {
                info!(queue = name, job_id = %job_id, "Abandoning in-flight job on hard stop");
                return;
            }
            outcome = tokio::time::timeout(
                self.options.timeout,
                (self.handler)(claimed, payload, cancel),
            ) => outcome,
        };

        match outcome {
            Err(_elapsed) => {
                let timeout_secs = self.options.timeout.as_secs();
                warn!(queue = name, job_id = %job_id, timeout_secs, "Job timed out");
                self.persist_failure(
                    &job_id,
                    JobDiagnostics {
                        message: Some(format!("Job timed out after {timeout_secs}s")),
                        exception: Some("timeout".to_string()),
                        ..Default::default()
                    },
                )
                .await;
            }
            Ok(Ok(JobCompletion::Done)) => {
                debug!(queue = name, job_id = %job_id, "Job completed");
                if let Err(e) = self.repo.mark_completed(&job_id).await {
                    error!(queue = name, job_id = %job_id, error = %e, "Failed to persist job completion");
                }
            }
            Ok(Ok(JobCompletion::Retry {
                delay_until: Some(at),
            })) => {
                debug!(queue = name, job_id = %job_id, resume_at = %at, "Job re-delayed by handler");
                match self.repo.mark_delayed(&job_id, at).await {
                    Ok(_) => self.job_delayed.notify_one(),
                    Err(e) => {
                        error!(queue = name, job_id = %job_id, error = %e, "Failed to persist job delay");
                    }
                }
            }
            Ok(Ok(JobCompletion::Retry { delay_until: None })) => {
                error!(queue = name, job_id = %job_id, "Handler requested a delay without a resume time");
                self.persist_failure(
                    &job_id,
                    JobDiagnostics {
                        message: Some("Delay requested without a resume time".to_string()),
                        exception: Some("defect".to_string()),
                        ..Default::default()
                    },
                )
                .await;
            }
            Ok(Err(e)) => {
                if e.is::<AppError>() {
                    warn!(queue = name, job_id = %job_id, error = %e, "Job failed with application error");
                } else {
                    error!(queue = name, job_id = %job_id, error = %e, "Job failed unexpectedly");
                }
                self.persist_failure(&job_id, diagnostics_for_error(&e)).await;
            }
        }
    }

    async fn persist_failure(&self, job_id: &str, diag: JobDiagnostics) {
        if let Err(e) = self.repo.mark_failed(job_id, diag).await {
            // The row stays Running; the stalled-job healthcheck will
            // eventually fail it.
            error!(
                queue = self.options.name,
                job_id = %job_id,
                error = %e,
                "Failed to persist job failure"
            );
        }
    }

    /// Promoter loop: moves due Delayed jobs to Queued until soft stop.
    async fn run_promoter(&self, soft: &CancellationToken) {
        let name = self.options.name;
        while !soft.is_cancelled() {
            let promoted = match self.repo.promote_due(name).await {
                Ok(count) => count,
                Err(e) => {
                    error!(queue = name, error = %e, "Delayed-job promotion failed");
                    tokio::select! {
                        () = tokio::time::sleep(LOOP_ERROR_BACKOFF) => {}
                        () = soft.cancelled() => {}
                    }
                    continue;
                }
            };
            if promoted > 0 {
                debug!(queue = name, count = promoted, "Promoted delayed jobs");
                self.job_queued.notify_one();
                continue;
            }

            let sleep_for = match self.repo.next_delayed_at(name).await {
                Ok(Some(due)) => (due - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(PROMOTER_POLL_INTERVAL),
                Ok(None) => PROMOTER_POLL_INTERVAL,
                Err(e) => {
                    error!(queue = name, error = %e, "Failed to read next delayed job");
                    LOOP_ERROR_BACKOFF
                }
            };
            tokio::select! {
                () = tokio::time::sleep(sleep_for) => {}
                () = self.job_delayed.notified() => {}
                () = soft.cancelled() => {}
            }
        }
        info!(queue = name, "Delayed-job promoter stopped");
    }
}

/// Capture diagnostics from a handler error chain.
fn diagnostics_for_error(err: &anyhow::Error) -> JobDiagnostics {
    JobDiagnostics {
        message: Some(err.to_string()),
        source: err.chain().nth(1).map(ToString::to_string),
        stack_trace: Some(format!("{err:?}")),
        exception: Some(format!("{err:#}")),
    }
}

/// Object-safe surface the orchestrator drives queues through.
#[async_trait]
pub trait QueueControl: Send + Sync {
    /// Queue name.
    fn name(&self) -> &'static str;

    /// Per-job execution timeout (used by the stalled-job healthcheck).
    fn timeout(&self) -> Duration;

    /// Requeue this queue's Running rows; used at startup so jobs
    /// interrupted by a crash re-execute.
    async fn recover(&self) -> AppResult<u64>;

    /// Run the scheduler and promoter loops until soft stop.
    async fn run(&self, soft: CancellationToken, hard: CancellationToken);

    /// Wake the scheduler; used after a manual retry re-queues a job.
    fn signal_queued(&self);
}

#[async_trait]
impl<T> QueueControl for JobQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        self.options.name
    }

    fn timeout(&self) -> Duration {
        self.options.timeout
    }

    async fn recover(&self) -> AppResult<u64> {
        let count = self.repo.requeue_running(Some(self.options.name)).await?;
        if count > 0 {
            self.job_queued.notify_one();
        }
        Ok(count)
    }

    async fn run(&self, soft: CancellationToken, hard: CancellationToken) {
        tokio::join!(self.run_scheduler(&soft, &hard), self.run_promoter(&soft));
    }

    fn signal_queued(&self) {
        self.job_queued.notify_one();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_capture_error_chain() {
        let root = std::io::Error::other("connection reset");
        let err = anyhow::Error::from(root).context("delivery failed");

        let diag = diagnostics_for_error(&err);
        assert_eq!(diag.message.as_deref(), Some("delivery failed"));
        assert_eq!(diag.source.as_deref(), Some("connection reset"));
        assert!(diag.stack_trace.unwrap().contains("connection reset"));
        assert!(diag.exception.unwrap().contains("delivery failed"));
    }

    #[test]
    fn test_diagnostics_without_cause() {
        let err = anyhow::anyhow!("boom");
        let diag = diagnostics_for_error(&err);
        assert_eq!(diag.message.as_deref(), Some("boom"));
        assert!(diag.source.is_none());
    }

    #[test]
    fn test_application_errors_are_recognized() {
        let err: anyhow::Error = AppError::BadRequest("bad payload".to_string()).into();
        assert!(err.is::<AppError>());

        let err = anyhow::anyhow!("not an app error");
        assert!(!err.is::<AppError>());
    }

    #[test]
    fn test_retry_without_resume_time_is_distinct() {
        let with_time = JobCompletion::Retry {
            delay_until: Some(Utc::now()),
        };
        let without_time = JobCompletion::Retry { delay_until: None };
        assert_ne!(with_time, without_time);
        assert_ne!(JobCompletion::Done, without_time);
    }
}
