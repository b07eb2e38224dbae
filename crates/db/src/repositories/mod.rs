//! Database repositories.

mod job;

pub use job::{JobCounts, JobDiagnostics, JobRepository};
