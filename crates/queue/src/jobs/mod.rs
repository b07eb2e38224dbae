//! Job definitions.

#![allow(missing_docs)]

mod background;
mod deliver;
mod inbox;
mod pre_deliver;

pub use background::BackgroundJob;
pub use deliver::DeliverJob;
pub use inbox::InboxJob;
pub use pre_deliver::PreDeliverJob;

/// Queue names, matching the `queue` column in the job table.
pub mod queues {
    /// Incoming activity processing.
    pub const INBOX: &str = "inbox";
    /// Recipient resolution and payload preparation before delivery.
    pub const PRE_DELIVER: &str = "pre-deliver";
    /// Outgoing activity delivery.
    pub const DELIVER: &str = "deliver";
    /// Generic background tasks.
    pub const BACKGROUND_TASK: &str = "background-task";
}
