use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{Job, JobErrorKind, JobState};

/// Result record for one terminal job, in completion order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEntry {
    pub job_id: Uuid,
    pub descriptor_id: String,
    pub final_state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_handle: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub artifact_paths: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<JobErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub attempts: u32,
    pub elapsed_seconds: f64,
}

impl From<&Job> for RunEntry {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            descriptor_id: job.descriptor_id.clone(),
            final_state: job.state,
            provider_handle: job.provider_handle.clone(),
            artifact_paths: job.artifacts.clone(),
            error_kind: job.error.as_ref().map(|e| e.kind),
            error_message: job.error.as_ref().map(|e| e.message.clone()),
            attempts: job.attempts,
            elapsed_seconds: job.elapsed.as_secs_f64(),
        }
    }
}

impl RunEntry {
    pub fn succeeded(&self) -> bool {
        self.final_state == JobState::Succeeded
    }
}

/// Final record of a batch run, written once to the run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub provider: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded_count: usize,
    pub failed_count: usize,
    /// Subset of `failed_count` that ended in `timed_out`.
    pub timed_out_count: usize,
    pub cancelled: bool,
    pub peak_in_flight: usize,
    pub entries: Vec<RunEntry>,
}

impl RunSummary {
    pub fn failed_entries(&self) -> impl Iterator<Item = &RunEntry> {
        self.entries.iter().filter(|e| !e.succeeded())
    }
}

/// Counts of jobs that have not reached a terminal state yet.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InFlightCounts {
    /// Not yet taken by a worker.
    pub queued: usize,
    /// Taken by a worker, not yet accepted by the provider.
    pub pending: usize,
    pub submitted: usize,
    pub polling: usize,
}

impl InFlightCounts {
    /// Jobs a worker currently holds.
    pub fn active(&self) -> usize {
        self.pending + self.submitted + self.polling
    }
}

/// Mid-run view for progress reporting. Only terminal jobs appear in `entries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: Uuid,
    pub total: usize,
    pub succeeded_count: usize,
    pub failed_count: usize,
    pub in_flight: InFlightCounts,
    pub finished: bool,
    pub entries: Vec<RunEntry>,
}
