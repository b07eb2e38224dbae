//! Generic background tasks.

use serde::{Deserialize, Serialize};

/// Long-running maintenance work that does not belong to the federation
/// pipeline. One queue carries all kinds; the variant tag selects the
/// handler branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BackgroundJob {
    /// Purge a deleted account's data.
    DeleteAccount {
        /// The user whose data is purged.
        user_id: String,
    },
    /// Remove expired notes (self-destructing posts).
    CleanExpiredNotes,
    /// Re-fetch a remote thread's ancestors and replies.
    BackfillThread {
        /// Root note of the thread.
        note_id: String,
    },
    /// Recompute an instance's reachability after repeated delivery
    /// failures.
    CheckInstanceHealth {
        /// Instance host name.
        host: String,
    },
}

impl BackgroundJob {
    /// Deduplication token for tasks where running two copies at once is
    /// wasteful or harmful. Tasks without one may run concurrently.
    #[must_use]
    pub fn mutex(&self) -> Option<String> {
        match self {
            Self::DeleteAccount { user_id } => Some(format!("delete-account:{user_id}")),
            Self::CleanExpiredNotes => Some("clean-expired-notes".to_string()),
            Self::BackfillThread { note_id } => Some(format!("backfill-thread:{note_id}")),
            Self::CheckInstanceHealth { host } => Some(format!("instance-health:{host}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_background_job_tagging() {
        let job = BackgroundJob::DeleteAccount {
            user_id: "user1".to_string(),
        };
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"kind\":\"deleteAccount\""));

        let parsed: BackgroundJob = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, BackgroundJob::DeleteAccount { .. }));
    }

    #[test]
    fn test_mutex_tokens_are_scoped() {
        let a = BackgroundJob::BackfillThread {
            note_id: "n1".to_string(),
        };
        let b = BackgroundJob::BackfillThread {
            note_id: "n2".to_string(),
        };
        assert_ne!(a.mutex(), b.mutex());
        assert_eq!(a.mutex().unwrap(), "backfill-thread:n1");
    }
}
