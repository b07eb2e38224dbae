//! Pre-delivery job.

use serde::{Deserialize, Serialize};

/// Job to resolve recipients for an activity and fan it out to the
/// delivery queue, one job per remote inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreDeliverJob {
    /// The user ID publishing the activity.
    pub user_id: String,

    /// Activity JSON to fan out.
    pub activity: serde_json::Value,

    /// Extra inbox URLs to deliver to in addition to the resolved
    /// follower inboxes (e.g. mentioned remote users).
    #[serde(default)]
    pub extra_inboxes: Vec<String>,
}

impl PreDeliverJob {
    /// Create a new pre-delivery job.
    #[must_use]
    pub const fn new(
        user_id: String,
        activity: serde_json::Value,
        extra_inboxes: Vec<String>,
    ) -> Self {
        Self {
            user_id,
            activity,
            extra_inboxes,
        }
    }
}
