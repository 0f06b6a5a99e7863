//! Build jobs and the durable queue that holds them.
//!
//! A job moves Queued → Running → Completed | Failed. Running jobs found
//! after a crash go back to Queued when the next worker starts. Failed jobs
//! stay failed; the next trigger for the same entity enqueues a new job.

mod job;
mod queue;

pub use job::{BuildJob, JobId, JobState, TriggerReason};
pub use queue::{JobQueue, QueueStats};
