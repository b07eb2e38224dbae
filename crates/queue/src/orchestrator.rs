//! Queue orchestrator.
//!
//! Owns the fixed set of named queues and everything that spans them: crash
//! recovery at startup, the stalled-job healthcheck, manual retry, and
//! two-phase graceful shutdown.

use std::sync::Arc;

use chrono::Utc;
use kazari_common::config::QueueConfig;
use kazari_common::{AppError, AppResult};
use kazari_db::entities::job;
use kazari_db::repositories::{JobCounts, JobRepository};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::QueueControl;

/// Admin-facing snapshot of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Queue name.
    pub name: String,
    /// Per-job timeout in seconds.
    pub timeout_secs: u64,
    /// Per-status row counts.
    pub counts: JobCounts,
}

/// Supervises all named queues for one node.
pub struct QueueOrchestrator {
    queues: Vec<Arc<dyn QueueControl>>,
    repo: JobRepository,
    config: QueueConfig,
    soft: CancellationToken,
    hard: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueOrchestrator {
    /// Create an orchestrator over a fixed set of queues.
    #[must_use]
    pub fn new(
        repo: JobRepository,
        config: QueueConfig,
        queues: Vec<Arc<dyn QueueControl>>,
    ) -> Self {
        Self {
            queues,
            repo,
            config,
            soft: CancellationToken::new(),
            hard: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Recover interrupted jobs, then start every queue loop and the
    /// stalled-job healthcheck.
    pub async fn start(&self) -> AppResult<()> {
        // Jobs left Running by a previous crash re-execute from Queued.
        for queue in &self.queues {
            let requeued = queue.recover().await?;
            if requeued > 0 {
                info!(
                    queue = queue.name(),
                    count = requeued,
                    "Requeued jobs interrupted by previous shutdown"
                );
            }
        }

        let mut tasks = self.tasks.lock().await;
        for queue in &self.queues {
            let queue = queue.clone();
            let soft = self.soft.clone();
            let hard = self.hard.clone();
            tasks.push(tokio::spawn(async move {
                queue.run(soft, hard).await;
            }));
        }
        tasks.push(self.spawn_healthcheck());

        info!(queues = self.queues.len(), "Queue orchestrator started");
        Ok(())
    }

    /// Periodically fail Running jobs whose worker evidently died without
    /// resetting them (e.g. a crashed node that never came back).
    ///
    /// A job counts as stalled once it has been Running for more than
    /// `stall_multiplier` times its queue's timeout, so the healthcheck can
    /// never race a worker that is merely slow.
    fn spawn_healthcheck(&self) -> JoinHandle<()> {
        let repo = self.repo.clone();
        let soft = self.soft.clone();
        let interval = self.config.healthcheck_interval();
        let windows: Vec<(&'static str, i64)> = self
            .queues
            .iter()
            .map(|q| {
                let secs = q.timeout().as_secs() * u64::from(self.config.stall_multiplier);
                (q.name(), i64::try_from(secs).unwrap_or(i64::MAX))
            })
            .collect();

        tokio::spawn(async move {
            loop {
                run_healthcheck(&repo, &windows).await;
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = soft.cancelled() => {
                        info!("Stalled-job healthcheck stopped");
                        return;
                    }
                }
            }
        })
    }

    /// Two-phase graceful shutdown.
    ///
    /// Soft stop first: no new jobs are claimed, in-flight ones get the
    /// grace window to finish. Then hard stop: remaining workers are
    /// abandoned and every Running row (across all queues) is reset to
    /// Queued so it re-executes after restart. No job is silently lost.
    pub async fn shutdown(&self) {
        info!(
            grace_secs = self.config.shutdown_grace_secs,
            "Queue shutdown: soft stop"
        );
        self.soft.cancel();
        tokio::time::sleep(self.config.shutdown_grace()).await;

        info!("Queue shutdown: hard stop");
        self.hard.cancel();
        match self.repo.requeue_running(None).await {
            Ok(0) => {}
            Ok(count) => info!(count, "Requeued jobs abandoned at hard stop"),
            Err(e) => error!(error = %e, "Failed to requeue abandoned jobs"),
        }

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Queue task ended abnormally");
            }
        }
        info!("Queue orchestrator stopped");
    }

    /// Manually retry a Failed job: reset it to Queued and wake its queue.
    pub async fn retry(&self, job_id: &str) -> AppResult<job::Model> {
        let retried = self.repo.retry(job_id).await?;
        info!(job_id, queue = %retried.queue, "Job manually requeued");
        if let Some(queue) = self.queues.iter().find(|q| q.name() == retried.queue) {
            queue.signal_queued();
        }
        Ok(retried)
    }

    /// Names of all registered queues.
    #[must_use]
    pub fn queue_names(&self) -> Vec<&'static str> {
        self.queues.iter().map(|q| q.name()).collect()
    }

    /// Snapshot of one queue by name.
    pub async fn queue_status(&self, name: &str) -> AppResult<QueueStatus> {
        let queue = self
            .queues
            .iter()
            .find(|q| q.name() == name)
            .ok_or_else(|| AppError::NotFound(format!("No such queue: {name}")))?;
        Ok(QueueStatus {
            name: queue.name().to_string(),
            timeout_secs: queue.timeout().as_secs(),
            counts: self.repo.counts(name).await?,
        })
    }

    /// Snapshot of every queue.
    pub async fn status(&self) -> AppResult<Vec<QueueStatus>> {
        let mut statuses = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            statuses.push(self.queue_status(queue.name()).await?);
        }
        Ok(statuses)
    }
}

async fn run_healthcheck(repo: &JobRepository, windows: &[(&'static str, i64)]) {
    for (name, window_secs) in windows {
        let cutoff = Utc::now() - chrono::Duration::seconds(*window_secs);
        match repo.fail_stalled(name, cutoff).await {
            Ok(ids) if ids.is_empty() => {}
            Ok(ids) => {
                warn!(queue = name, job_ids = ?ids, "Failed stalled jobs");
            }
            Err(e) => {
                error!(queue = name, error = %e, "Stalled-job healthcheck failed");
            }
        }
    }
}
