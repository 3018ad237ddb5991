use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

/// Lifecycle state of one generation job.
///
/// `Pending -> Submitted -> Polling -> {Succeeded | Failed | TimedOut}`, with
/// `Pending -> Failed` for jobs rejected before submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Pending,
    Submitted,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::TimedOut)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Failed)
                | (Submitted, Failed)
                | (Submitted, Polling)
                | (Polling, Succeeded)
                | (Polling, Failed)
                | (Polling, TimedOut)
        )
    }
}

/// Why a job ended without artifacts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
pub enum JobErrorKind {
    ValidationError,
    SubmissionError,
    ProviderFailure,
    FetchError,
    TimeoutError,
    /// Never started because the batch was cancelled or halted.
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

/// Run-time entity for one execution of a descriptor.
///
/// Owned by the polling state machine until it reaches a terminal state.
/// Once terminal, exactly one of `artifacts` (non-empty) or `error` is set.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: Uuid,
    pub descriptor_id: String,
    pub state: JobState,
    pub provider_handle: Option<String>,
    pub attempts: u32,
    pub elapsed: Duration,
    pub artifacts: Vec<PathBuf>,
    pub error: Option<JobError>,
    transitions: Vec<JobState>,
}

impl Job {
    pub fn new(descriptor_id: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            descriptor_id: descriptor_id.into(),
            state: JobState::Pending,
            provider_handle: None,
            attempts: 0,
            elapsed: Duration::ZERO,
            artifacts: Vec::new(),
            error: None,
            transitions: vec![JobState::Pending],
        }
    }

    /// A job that was never started because the batch stopped taking work.
    pub fn cancelled(descriptor_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut job = Self::new(descriptor_id);
        job.fail(JobErrorKind::Cancelled, reason);
        job
    }

    /// Every state this job has been in, in order.
    pub fn transitions(&self) -> &[JobState] {
        &self.transitions
    }

    /// The last non-terminal state, i.e. the one a terminal job left.
    pub fn previous_state(&self) -> JobState {
        let len = self.transitions.len();
        if len >= 2 {
            self.transitions[len - 2]
        } else {
            self.state
        }
    }

    /// Move to `next`. Returns the state that was left.
    pub(crate) fn advance(&mut self, next: JobState) -> JobState {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal job transition {} -> {}",
            self.state,
            next
        );
        let previous = self.state;
        self.state = next;
        self.transitions.push(next);
        previous
    }

    pub(crate) fn succeed(&mut self, artifacts: Vec<PathBuf>) -> JobState {
        debug_assert!(!artifacts.is_empty());
        self.artifacts = artifacts;
        self.error = None;
        self.advance(JobState::Succeeded)
    }

    pub(crate) fn fail(&mut self, kind: JobErrorKind, message: impl Into<String>) -> JobState {
        let next = if kind == JobErrorKind::TimeoutError {
            JobState::TimedOut
        } else {
            JobState::Failed
        };
        self.artifacts.clear();
        self.error = Some(JobError {
            kind,
            message: message.into(),
        });
        self.advance(next)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut job = Job::new("shoe-01");
        job.advance(JobState::Submitted);
        job.advance(JobState::Polling);
        job.succeed(vec![PathBuf::from("out.png")]);

        assert_eq!(
            job.transitions(),
            &[
                JobState::Pending,
                JobState::Submitted,
                JobState::Polling,
                JobState::Succeeded
            ]
        );
        assert_eq!(job.previous_state(), JobState::Polling);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_timeout_maps_to_timed_out_state() {
        let mut job = Job::new("bag-02");
        job.advance(JobState::Submitted);
        job.advance(JobState::Polling);
        job.fail(JobErrorKind::TimeoutError, "no result after 300s");

        assert_eq!(job.state, JobState::TimedOut);
        assert!(job.artifacts.is_empty());
        assert_eq!(job.error.as_ref().unwrap().kind, JobErrorKind::TimeoutError);
    }

    #[test]
    fn test_submitted_cannot_skip_polling() {
        assert!(!JobState::Submitted.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Pending.can_transition_to(JobState::Polling));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Failed));
        assert!(!JobState::TimedOut.can_transition_to(JobState::Polling));
    }

    #[test]
    fn test_cancelled_job_never_submitted() {
        let job = Job::cancelled("hat-03", "batch cancelled");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.previous_state(), JobState::Pending);
        assert_eq!(job.error.unwrap().kind, JobErrorKind::Cancelled);
    }
}
