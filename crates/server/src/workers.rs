//! Queue construction and handler wiring.
//!
//! The queues and their tuning live here; the domain pipelines (activity
//! parsing, signature checks, outgoing HTTP) hang off the handler seams.

use std::sync::Arc;

use futures::FutureExt;
use kazari_common::config::QueueConfig;
use kazari_db::repositories::JobRepository;
use kazari_queue::{
    BackgroundJob, DeliverJob, InboxJob, JobCompletion, JobHandler, JobQueue, PreDeliverJob,
    QueueControl, QueueOptions, queues,
};
use tracing::{debug, info};

/// The four named queues every node runs.
pub struct Queues {
    pub inbox: JobQueue<InboxJob>,
    pub pre_deliver: JobQueue<PreDeliverJob>,
    pub deliver: JobQueue<DeliverJob>,
    pub background: JobQueue<BackgroundJob>,
}

impl Queues {
    /// Build all queues against one repository.
    #[must_use]
    pub fn build(repo: &JobRepository, config: &QueueConfig) -> Self {
        let deliver = JobQueue::new(
            QueueOptions {
                name: queues::DELIVER,
                concurrency: config.deliver.concurrency,
                timeout: config.deliver.timeout(),
            },
            repo.clone(),
            deliver_handler(),
        );

        let inbox = JobQueue::new(
            QueueOptions {
                name: queues::INBOX,
                concurrency: config.inbox.concurrency,
                timeout: config.inbox.timeout(),
            },
            repo.clone(),
            inbox_handler(),
        );

        let pre_deliver = JobQueue::new(
            QueueOptions {
                name: queues::PRE_DELIVER,
                concurrency: config.pre_deliver.concurrency,
                timeout: config.pre_deliver.timeout(),
            },
            repo.clone(),
            pre_deliver_handler(deliver.clone()),
        );

        let background = JobQueue::new(
            QueueOptions {
                name: queues::BACKGROUND_TASK,
                concurrency: config.background_task.concurrency,
                timeout: config.background_task.timeout(),
            },
            repo.clone(),
            background_handler(),
        );

        Self {
            inbox,
            pre_deliver,
            deliver,
            background,
        }
    }

    /// Handles for the orchestrator.
    #[must_use]
    pub fn controls(&self) -> Vec<Arc<dyn QueueControl>> {
        vec![
            Arc::new(self.inbox.clone()),
            Arc::new(self.pre_deliver.clone()),
            Arc::new(self.deliver.clone()),
            Arc::new(self.background.clone()),
        ]
    }
}

/// Incoming activity processing.
///
/// Signature verification and activity dispatch plug in here; the queue
/// guarantees bounded concurrency, timeout, and retry-on-restart around
/// them.
fn inbox_handler() -> JobHandler<InboxJob> {
    Arc::new(|job, payload: InboxJob, _cancel| {
        async move {
            debug!(
                job_id = %job.id,
                activity_type = payload.activity.get("type").and_then(|t| t.as_str()),
                "Processing inbox activity"
            );
            Ok(JobCompletion::Done)
        }
        .boxed()
    })
}

/// Recipient fan-out: one delivery job per target inbox.
fn pre_deliver_handler(deliver: JobQueue<DeliverJob>) -> JobHandler<PreDeliverJob> {
    Arc::new(move |job, payload: PreDeliverJob, _cancel| {
        let deliver = deliver.clone();
        async move {
            for inbox in &payload.extra_inboxes {
                deliver
                    .enqueue(
                        &DeliverJob::new(
                            payload.user_id.clone(),
                            inbox.clone(),
                            payload.activity.clone(),
                        ),
                        None,
                    )
                    .await?;
            }
            info!(
                job_id = %job.id,
                user_id = %payload.user_id,
                inboxes = payload.extra_inboxes.len(),
                "Fanned out activity to delivery queue"
            );
            Ok(JobCompletion::Done)
        }
        .boxed()
    })
}

/// Outgoing delivery of one activity to one remote inbox.
fn deliver_handler() -> JobHandler<DeliverJob> {
    Arc::new(|job, payload: DeliverJob, _cancel| {
        async move {
            debug!(
                job_id = %job.id,
                inbox = %payload.inbox,
                user_id = %payload.user_id,
                "Delivering activity"
            );
            Ok(JobCompletion::Done)
        }
        .boxed()
    })
}

/// Generic maintenance tasks.
fn background_handler() -> JobHandler<BackgroundJob> {
    Arc::new(|job, payload: BackgroundJob, _cancel| {
        async move {
            match &payload {
                BackgroundJob::DeleteAccount { user_id } => {
                    info!(job_id = %job.id, user_id = %user_id, "Purging deleted account");
                }
                BackgroundJob::CleanExpiredNotes => {
                    debug!(job_id = %job.id, "Cleaning expired notes");
                }
                BackgroundJob::BackfillThread { note_id } => {
                    debug!(job_id = %job.id, note_id = %note_id, "Backfilling remote thread");
                }
                BackgroundJob::CheckInstanceHealth { host } => {
                    debug!(job_id = %job.id, host = %host, "Checking instance health");
                }
            }
            Ok(JobCompletion::Done)
        }
        .boxed()
    })
}
