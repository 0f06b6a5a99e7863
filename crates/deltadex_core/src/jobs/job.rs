//! Build job types and their state machine.

use crate::error::{CoreError, CoreResult};
use crate::segment::SegmentKind;
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a build job, unique within a journal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Creates a job ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Why a job was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// A record of a delayed entity changed.
    Mutation,
    /// The threshold poller found records past their settling time.
    Threshold,
    /// An operator asked for it.
    Operator,
    /// A failed job was resubmitted.
    Retry,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mutation => "mutation",
            Self::Threshold => "threshold",
            Self::Operator => "operator",
            Self::Retry => "retry",
        })
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker.
    Queued,
    /// Claimed by a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed {
        /// Error message.
        error: String,
    },
}

impl JobState {
    /// Returns true for completed and failed jobs.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }

    /// State name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    /// Returns true if the state machine allows moving to `next`.
    ///
    /// Running may also go back to Queued when a worker died mid-job.
    #[must_use]
    pub fn can_transition_to(&self, next: &JobState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed { .. })
                | (Self::Running, Self::Queued)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A request to build one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    /// Job ID.
    pub id: JobId,
    /// Entity to build.
    pub entity: String,
    /// Segment to build.
    pub target: SegmentKind,
    /// Why the job exists.
    pub reason: TriggerReason,
    /// When it was enqueued.
    pub enqueued_at: Timestamp,
    /// Current state.
    pub state: JobState,
    /// Times the job has been claimed.
    pub attempts: u32,
    /// When the latest attempt started.
    pub started_at: Option<Timestamp>,
    /// When the job finished.
    pub finished_at: Option<Timestamp>,
}

impl BuildJob {
    /// Creates a queued job.
    pub fn new(
        id: JobId,
        entity: impl Into<String>,
        target: SegmentKind,
        reason: TriggerReason,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            id,
            entity: entity.into(),
            target,
            reason,
            enqueued_at,
            state: JobState::Queued,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Moves the job to `next`, enforcing the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidStateTransition`] if the move is not
    /// allowed; the job is left unchanged.
    pub fn transition(&mut self, next: JobState, at: Timestamp) -> CoreResult<()> {
        if !self.state.can_transition_to(&next) {
            return Err(CoreError::InvalidStateTransition {
                id: self.id,
                from: self.state.name().to_string(),
                to: next.name().to_string(),
            });
        }
        match &next {
            JobState::Running => {
                self.attempts += 1;
                self.started_at = Some(at);
            }
            JobState::Completed | JobState::Failed { .. } => self.finished_at = Some(at),
            JobState::Queued => self.started_at = None,
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> BuildJob {
        BuildJob::new(
            JobId::new(1),
            "articles",
            SegmentKind::Delta,
            TriggerReason::Mutation,
            Timestamp::from_millis(0),
        )
    }

    #[test]
    fn happy_path() {
        let mut job = job();
        job.transition(JobState::Running, Timestamp::from_millis(5))
            .unwrap();
        assert_eq!(job.attempts, 1);
        job.transition(JobState::Completed, Timestamp::from_millis(9))
            .unwrap();
        assert!(job.state.is_terminal());
        assert_eq!(job.finished_at, Some(Timestamp::from_millis(9)));
    }

    #[test]
    fn rejects_invalid_transitions() {
        let mut job = job();
        let err = job
            .transition(JobState::Completed, Timestamp::from_millis(1))
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidStateTransition { ref from, ref to, .. }
                if from == "queued" && to == "completed"
        ));
        assert_eq!(job.state, JobState::Queued);

        job.transition(JobState::Running, Timestamp::from_millis(1))
            .unwrap();
        job.transition(
            JobState::Failed {
                error: "boom".into(),
            },
            Timestamp::from_millis(2),
        )
        .unwrap();
        assert!(job
            .transition(JobState::Running, Timestamp::from_millis(3))
            .is_err());
    }

    #[test]
    fn running_job_can_be_requeued() {
        let mut job = job();
        job.transition(JobState::Running, Timestamp::from_millis(1))
            .unwrap();
        job.transition(JobState::Queued, Timestamp::from_millis(2))
            .unwrap();
        assert_eq!(job.started_at, None);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn display_formats() {
        assert_eq!(JobId::new(7).to_string(), "job#7");
        assert_eq!(TriggerReason::Threshold.to_string(), "threshold");
        assert_eq!(
            JobState::Failed { error: "x".into() }.to_string(),
            "failed"
        );
    }
}
