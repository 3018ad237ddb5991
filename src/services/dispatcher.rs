use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::models::descriptor::{enabled_only, BatchError, JobDescriptor};
use crate::models::job::{Job, JobErrorKind};
use crate::models::summary::RunSummary;
use crate::services::aggregator::Aggregator;
use crate::services::poller::{JobRunner, PollSettings};
use crate::services::provider::ProviderClient;
use crate::services::queue::ReadyQueue;
use crate::services::retry::RetryPolicy;
use crate::services::storage::ArtifactStore;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Upper bound on jobs holding non-terminal state at once
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub rate_limit: RetryPolicy,
    pub fetch_retry: RetryPolicy,
    /// 0 disables the breaker
    pub max_consecutive_failures: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        let poll = PollSettings::default();
        Self {
            max_workers: 3,
            poll_interval: poll.poll_interval,
            timeout: poll.timeout,
            rate_limit: poll.rate_limit,
            fetch_retry: poll.fetch_retry,
            max_consecutive_failures: 5,
        }
    }
}

impl DispatchSettings {
    fn poll_settings(&self) -> PollSettings {
        PollSettings {
            poll_interval: self.poll_interval,
            timeout: self.timeout,
            rate_limit: self.rate_limit,
            fetch_retry: self.fetch_retry,
        }
    }
}

/// Runs a batch through a fixed pool of workers.
///
/// Each worker pulls the next descriptor off a shared queue and drives it to
/// a terminal state before taking another, so the pool width bounds the
/// number of jobs in flight.
pub struct Dispatcher {
    runner: Arc<JobRunner>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        store: Arc<ArtifactStore>,
        settings: DispatchSettings,
    ) -> Self {
        let runner = Arc::new(JobRunner::new(provider, store, settings.poll_settings()));
        Self { runner, settings }
    }

    /// Run every enabled descriptor and return the summary once all of them
    /// are terminal.
    ///
    /// Raising the cancel flag stops workers from taking new descriptors;
    /// whatever was still queued is recorded as cancelled.
    pub async fn run(
        &self,
        descriptors: Vec<JobDescriptor>,
        aggregator: Arc<Aggregator>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunSummary, BatchError> {
        let submitted = descriptors.len();
        let descriptors = enabled_only(descriptors);
        if descriptors.is_empty() {
            return Err(BatchError::EmptyBatch);
        }

        let total = descriptors.len();
        let width = self.settings.max_workers.clamp(1, total);
        info!(
            run_id = %aggregator.run_id(),
            total,
            skipped = submitted - total,
            workers = width,
            "Starting batch"
        );

        aggregator.begin(total);
        metrics::counter!("generation_jobs_total").increment(total as u64);

        let queue = Arc::new(ReadyQueue::new(descriptors));
        let breaker = Arc::new(FailureBreaker::new(self.settings.max_consecutive_failures));

        let mut workers = JoinSet::new();
        for worker_id in 0..width {
            workers.spawn(worker_loop(
                worker_id,
                self.runner.clone(),
                queue.clone(),
                aggregator.clone(),
                breaker.clone(),
                cancel.clone(),
            ));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task aborted");
            }
        }

        // Workers only quit with work queued on cancel or a tripped breaker;
        // anything else left behind still gets run.
        if queue.queue_depth() > 0 && !breaker.is_tripped() && !*cancel.borrow() {
            warn!(remaining = queue.queue_depth(), "Workers exited early, running the rest");
            worker_loop(
                width,
                self.runner.clone(),
                queue.clone(),
                aggregator.clone(),
                breaker.clone(),
                cancel.clone(),
            )
            .await;
        }

        let leftovers = queue.drain();
        let stopped_early = breaker.is_tripped() || *cancel.borrow();
        if stopped_early {
            aggregator.mark_cancelled();
        }
        if !leftovers.is_empty() {
            let reason = if breaker.is_tripped() {
                "batch halted after repeated failures"
            } else {
                "batch cancelled before start"
            };
            info!(remaining = leftovers.len(), reason, "Recording unstarted jobs");
            for descriptor in leftovers {
                let job = Job::cancelled(&descriptor.id, reason);
                aggregator.job_started(job.job_id);
                aggregator.record(&job);
            }
        }

        let summary = aggregator.finish();
        info!(
            run_id = %summary.run_id,
            total = summary.total,
            succeeded = summary.succeeded_count,
            failed = summary.failed_count,
            timed_out = summary.timed_out_count,
            cancelled = summary.cancelled,
            "Batch complete"
        );
        Ok(summary)
    }
}

async fn worker_loop(
    worker_id: usize,
    runner: Arc<JobRunner>,
    queue: Arc<ReadyQueue>,
    aggregator: Arc<Aggregator>,
    breaker: Arc<FailureBreaker>,
    cancel: watch::Receiver<bool>,
) {
    loop {
        if *cancel.borrow() || breaker.is_tripped() {
            debug!(worker_id, "Worker stopping early");
            break;
        }
        let Some(descriptor) = queue.dequeue() else {
            break;
        };

        let job = Job::new(&descriptor.id);
        let job_id = job.job_id;
        aggregator.job_started(job_id);

        let run = runner.drive(job, &descriptor, &aggregator, cancel.clone());
        let job = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(job) => job,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    worker_id,
                    %job_id,
                    descriptor_id = %descriptor.id,
                    panic = %message,
                    "Job panicked, recording it as failed"
                );
                let mut lost = Job::new(&descriptor.id);
                lost.job_id = job_id;
                lost.fail(
                    JobErrorKind::ProviderFailure,
                    format!("job panicked: {message}"),
                );
                lost
            }
        };
        aggregator.record(&job);

        if breaker.observe(&job) {
            error!(
                worker_id,
                limit = breaker.limit,
                remaining = queue.queue_depth(),
                "Too many consecutive failures, halting batch"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Trips after `limit` provider-side failures in a row.
///
/// Validation failures and cancellations say nothing about the provider and
/// leave the streak alone.
struct FailureBreaker {
    limit: usize,
    streak: AtomicUsize,
    tripped: AtomicBool,
}

impl FailureBreaker {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            streak: AtomicUsize::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Returns true only for the observation that trips the breaker.
    fn observe(&self, job: &Job) -> bool {
        match job.error.as_ref().map(|e| e.kind) {
            None => {
                self.streak.store(0, Ordering::Release);
                false
            }
            Some(JobErrorKind::ValidationError | JobErrorKind::Cancelled) => false,
            Some(_) => {
                let streak = self.streak.fetch_add(1, Ordering::AcqRel) + 1;
                self.limit > 0
                    && streak >= self.limit
                    && !self.tripped.swap(true, Ordering::AcqRel)
            }
        }
    }
}

/// Refuse to start when the provider reports fewer than `min_credits`.
///
/// Providers without a balance endpoint, and balance lookups that fail, let
/// the batch through.
pub async fn preflight_credits(
    provider: &dyn ProviderClient,
    min_credits: u64,
) -> Result<Option<u64>, PreflightError> {
    let available = match provider.credits().await {
        Ok(Some(available)) => available,
        Ok(None) => return Ok(None),
        Err(e) => {
            warn!(provider = provider.name(), error = %e, "Could not read credit balance");
            return Ok(None);
        }
    };

    if available < min_credits {
        return Err(PreflightError::InsufficientCredits {
            available,
            required: min_credits,
        });
    }
    if available < min_credits.saturating_mul(4) {
        warn!(provider = provider.name(), available, "Credit balance is running low");
    } else {
        info!(provider = provider.name(), available, "Credit balance checked");
    }
    Ok(Some(available))
}

#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("Provider has {available} credits left, at least {required} required")]
    InsufficientCredits { available: u64, required: u64 },
}
