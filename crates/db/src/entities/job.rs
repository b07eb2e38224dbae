//! Job entity.
//!
//! One persisted, asynchronously executed unit of work. Rows are never
//! deleted by the queue subsystem; terminal jobs are kept for audit and
//! manual retry.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    #[sea_orm(string_value = "queued")]
    Queued,
    /// Waiting for `delayed_until` to elapse.
    #[sea_orm(string_value = "delayed")]
    Delayed,
    /// Claimed by a worker and executing.
    #[sea_orm(string_value = "running")]
    Running,
    /// Finished successfully.
    #[sea_orm(string_value = "completed")]
    Completed,
    /// Finished with an error; eligible for manual retry.
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl JobStatus {
    /// Whether this status is terminal (`Completed` or `Failed`).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A job row.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "job")]
pub struct Model {
    /// Sortable, globally unique ULID.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Name of the queue this job belongs to.
    #[sea_orm(indexed)]
    pub queue: String,

    /// Current status.
    pub status: JobStatus,

    /// When this job was inserted.
    pub queued_at: DateTimeWithTimeZone,

    /// When a worker last claimed this job. Set once the job has left
    /// Queued/Delayed at least once.
    #[sea_orm(nullable)]
    pub started_at: Option<DateTimeWithTimeZone>,

    /// When this job reached a terminal status.
    #[sea_orm(nullable)]
    pub finished_at: Option<DateTimeWithTimeZone>,

    /// For Delayed jobs, when they become due.
    #[sea_orm(nullable)]
    pub delayed_until: Option<DateTimeWithTimeZone>,

    /// Number of manual retries.
    #[sea_orm(default_value = 0)]
    pub retry_count: i32,

    /// Top-level error message of the last failure.
    #[sea_orm(nullable)]
    pub exception_message: Option<String>,

    /// First underlying cause of the last failure.
    #[sea_orm(nullable)]
    pub exception_source: Option<String>,

    /// Debug rendering of the failure, including the cause chain.
    #[sea_orm(nullable)]
    pub stack_trace: Option<String>,

    /// Full failure rendering, or a fixed tag (`timeout`, `stalled`).
    #[sea_orm(nullable)]
    pub exception: Option<String>,

    /// Serialized job payload.
    #[sea_orm(column_type = "JsonBinary")]
    pub data: Json,

    /// Optional deduplication token. At most one non-terminal job may carry
    /// a given value (enforced by a partial unique index).
    #[sea_orm(nullable)]
    pub mutex: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Delayed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
