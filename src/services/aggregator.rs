use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::job::{Job, JobState};
use crate::models::summary::{InFlightCounts, ProgressSnapshot, RunEntry, RunSummary};

/// Sole owner of run state: terminal entries in completion order plus the
/// state of every job still in flight.
///
/// Workers append through [`record`](Self::record); progress readers take
/// [`snapshot`](Self::snapshot). Both go through one lock, so a snapshot never
/// shows a half-applied update. [`begin`](Self::begin) clears everything from
/// a previous run; the run id stays the same.
pub struct Aggregator {
    run_id: Uuid,
    provider: String,
    inner: Mutex<RunState>,
}

struct RunState {
    started_at: DateTime<Utc>,
    expected: usize,
    entries: Vec<RunEntry>,
    queued: usize,
    live: HashMap<Uuid, JobState>,
    peak_in_flight: usize,
    cancelled: bool,
    finished: bool,
}

impl Aggregator {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            provider: provider.into(),
            inner: Mutex::new(RunState {
                started_at: Utc::now(),
                expected: 0,
                entries: Vec::new(),
                queued: 0,
                live: HashMap::new(),
                peak_in_flight: 0,
                cancelled: false,
                finished: false,
            }),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Start a fresh run with `total` descriptors waiting.
    pub fn begin(&self, total: usize) {
        let mut state = self.inner.lock();
        state.started_at = Utc::now();
        state.expected = total;
        state.entries.clear();
        state.queued = total;
        state.live.clear();
        state.peak_in_flight = 0;
        state.cancelled = false;
        state.finished = false;
    }

    /// A worker took a descriptor off the ready queue and created `job_id`.
    pub fn job_started(&self, job_id: Uuid) {
        let mut state = self.inner.lock();
        state.queued = state.queued.saturating_sub(1);
        state.live.insert(job_id, JobState::Pending);
        let active = state.live.len();
        state.peak_in_flight = state.peak_in_flight.max(active);
        metrics::gauge!("generation_jobs_in_flight").set(active as f64);
    }

    /// A started job moved to another non-terminal state.
    pub fn track(&self, job_id: Uuid, to: JobState) {
        if let Some(current) = self.inner.lock().live.get_mut(&job_id) {
            *current = to;
        }
    }

    /// Append a terminal job in arrival order.
    pub fn record(&self, job: &Job) {
        debug_assert!(job.is_terminal(), "only terminal jobs are recorded");
        let entry = RunEntry::from(job);

        let mut state = self.inner.lock();
        state.live.remove(&job.job_id);
        metrics::gauge!("generation_jobs_in_flight").set(state.live.len() as f64);

        match &entry.error_kind {
            None => metrics::counter!("generation_jobs_succeeded").increment(1),
            Some(kind) => {
                metrics::counter!("generation_jobs_failed", "kind" => kind.to_string()).increment(1)
            }
        }
        metrics::histogram!("generation_job_seconds").record(entry.elapsed_seconds);

        state.entries.push(entry);
    }

    /// Note that the batch stopped taking new work early.
    pub fn mark_cancelled(&self) {
        self.inner.lock().cancelled = true;
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Terminal entries so far plus in-flight counts.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.inner.lock();
        let succeeded_count = state.entries.iter().filter(|e| e.succeeded()).count();
        ProgressSnapshot {
            run_id: self.run_id,
            total: state.expected,
            succeeded_count,
            failed_count: state.entries.len() - succeeded_count,
            in_flight: state.in_flight(),
            finished: state.finished,
            entries: state.entries.clone(),
        }
    }

    /// Freeze the run and derive the final counts.
    ///
    /// Called after every worker has been joined, so all writes are visible.
    pub fn finish(&self) -> RunSummary {
        let mut state = self.inner.lock();
        state.finished = true;

        let total = state.entries.len();
        if total != state.expected {
            tracing::warn!(
                expected = state.expected,
                recorded = total,
                "Recorded entries do not match dispatched descriptors"
            );
        }
        let succeeded_count = state.entries.iter().filter(|e| e.succeeded()).count();
        let timed_out_count = state
            .entries
            .iter()
            .filter(|e| e.final_state == JobState::TimedOut)
            .count();

        RunSummary {
            run_id: self.run_id,
            provider: self.provider.clone(),
            started_at: state.started_at,
            ended_at: Utc::now(),
            total,
            succeeded_count,
            failed_count: total - succeeded_count,
            timed_out_count,
            cancelled: state.cancelled,
            peak_in_flight: state.peak_in_flight,
            entries: state.entries.clone(),
        }
    }
}

impl RunState {
    fn in_flight(&self) -> InFlightCounts {
        let mut counts = InFlightCounts {
            queued: self.queued,
            ..InFlightCounts::default()
        };
        for state in self.live.values() {
            match state {
                JobState::Pending => counts.pending += 1,
                JobState::Submitted => counts.submitted += 1,
                JobState::Polling => counts.polling += 1,
                JobState::Succeeded | JobState::Failed | JobState::TimedOut => {}
            }
        }
        counts
    }
}

/// Persists finished run summaries as pretty JSON documents.
pub struct LogWriter {
    dir: PathBuf,
}

impl LogWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write `run_{timestamp}_{run_id}.json` and return its path.
    pub async fn write(&self, summary: &RunSummary) -> Result<PathBuf, LogWriteError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.dir.join(format!(
            "run_{}_{}.json",
            summary.started_at.format("%Y%m%d_%H%M%S"),
            summary.run_id.simple()
        ));
        let body = serde_json::to_vec_pretty(summary)?;
        tokio::fs::write(&path, body).await?;

        tracing::info!(path = %path.display(), "Run log written");
        Ok(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogWriteError {
    #[error("Failed to write run log: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize run log: {0}")]
    Serialize(#[from] serde_json::Error),
}
