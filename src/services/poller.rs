use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::models::descriptor::JobDescriptor;
use crate::models::job::{Job, JobErrorKind, JobState};
use crate::services::aggregator::Aggregator;
use crate::services::provider::{
    Artifact, ArtifactRef, FetchError, PollStatus, ProviderClient, ProviderHandle, SubmissionError,
};
use crate::services::retry::{wait_or_cancel, RetryPolicy};
use crate::services::storage::ArtifactStore;
use crate::services::validation;

/// Pacing and retry knobs for a single job.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub poll_interval: Duration,
    /// Measured from the moment the provider accepted the job.
    pub timeout: Duration,
    pub rate_limit: RetryPolicy,
    pub fetch_retry: RetryPolicy,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
            rate_limit: RetryPolicy::default(),
            fetch_retry: RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(30)),
        }
    }
}

/// Drives one descriptor from validation to a terminal state.
///
/// A fresh [`Job`] is built on every call, so running the same descriptor
/// twice yields two independent jobs.
pub struct JobRunner {
    provider: Arc<dyn ProviderClient>,
    store: Arc<ArtifactStore>,
    settings: PollSettings,
}

/// Why submission ended without a handle.
enum SubmitFailure {
    Provider(SubmissionError),
    Cancelled,
}

impl JobRunner {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        store: Arc<ArtifactStore>,
        settings: PollSettings,
    ) -> Self {
        Self {
            provider,
            store,
            settings,
        }
    }

    /// Run a descriptor to completion. Never returns a non-terminal job.
    pub async fn run(
        &self,
        descriptor: &JobDescriptor,
        aggregator: &Aggregator,
        cancel: watch::Receiver<bool>,
    ) -> Job {
        self.drive(Job::new(&descriptor.id), descriptor, aggregator, cancel)
            .await
    }

    /// Drive an already created `Pending` job, so the caller knows its id up front.
    pub(crate) async fn drive(
        &self,
        mut job: Job,
        descriptor: &JobDescriptor,
        aggregator: &Aggregator,
        mut cancel: watch::Receiver<bool>,
    ) -> Job {
        if let Err(e) = validation::validate_descriptor(descriptor).await {
            warn!(
                job_id = %job.job_id,
                descriptor_id = %descriptor.id,
                error = %e,
                "Descriptor failed validation, not submitted"
            );
            job.fail(JobErrorKind::ValidationError, e.to_string());
            return job;
        }

        let handle = match self.submit(descriptor, &job, &mut cancel).await {
            Ok(handle) => handle,
            Err(SubmitFailure::Provider(e)) => {
                warn!(
                    job_id = %job.job_id,
                    descriptor_id = %descriptor.id,
                    error = %e,
                    "Provider rejected submission"
                );
                job.fail(JobErrorKind::SubmissionError, e.to_string());
                return job;
            }
            Err(SubmitFailure::Cancelled) => {
                job.fail(JobErrorKind::Cancelled, "batch cancelled before submission");
                return job;
            }
        };

        let submitted_at = Instant::now();
        job.provider_handle = Some(handle.id.clone());
        job.advance(JobState::Submitted);
        aggregator.track(job.job_id, JobState::Submitted);
        info!(
            job_id = %job.job_id,
            descriptor_id = %descriptor.id,
            provider_handle = %handle.id,
            provider = self.provider.name(),
            "Job submitted"
        );

        job.advance(JobState::Polling);
        aggregator.track(job.job_id, JobState::Polling);

        self.poll_until_terminal(descriptor, &mut job, &handle, submitted_at, &mut cancel)
            .await;
        job.elapsed = submitted_at.elapsed();

        match &job.error {
            None => info!(
                job_id = %job.job_id,
                descriptor_id = %descriptor.id,
                attempts = job.attempts,
                artifacts = job.artifacts.len(),
                elapsed_secs = job.elapsed.as_secs_f64(),
                "Job succeeded"
            ),
            Some(error) => warn!(
                job_id = %job.job_id,
                descriptor_id = %descriptor.id,
                attempts = job.attempts,
                state = %job.state,
                kind = %error.kind,
                error = %error.message,
                "Job did not succeed"
            ),
        }
        job
    }

    /// Submit, backing off while the provider reports rate limiting.
    async fn submit(
        &self,
        descriptor: &JobDescriptor,
        job: &Job,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ProviderHandle, SubmitFailure> {
        let policy = self.settings.rate_limit;
        let mut retries = 0;

        loop {
            if *cancel.borrow() {
                return Err(SubmitFailure::Cancelled);
            }
            match self.provider.submit(descriptor).await {
                Ok(handle) => return Ok(handle),
                Err(SubmissionError::RateLimited { retry_after }) if policy.allows(retries) => {
                    let delay = policy.delay_for(retries, retry_after);
                    retries += 1;
                    warn!(
                        job_id = %job.job_id,
                        descriptor_id = %descriptor.id,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, backing off before resubmitting"
                    );
                    if !wait_or_cancel(delay, cancel).await {
                        return Err(SubmitFailure::Cancelled);
                    }
                }
                Err(e) => return Err(SubmitFailure::Provider(e)),
            }
        }
    }

    async fn poll_until_terminal(
        &self,
        descriptor: &JobDescriptor,
        job: &mut Job,
        handle: &ProviderHandle,
        submitted_at: Instant,
        cancel: &mut watch::Receiver<bool>,
    ) {
        let timeout = self.settings.timeout;

        loop {
            job.attempts += 1;
            metrics::counter!("generation_polls_total").increment(1);

            // The status check always runs before the timeout is enforced.
            match self.provider.poll(handle).await {
                Ok(PollStatus::Ready(refs)) => {
                    self.collect(descriptor, job, refs, cancel).await;
                    return;
                }
                Ok(PollStatus::Failed(reason)) => {
                    job.fail(JobErrorKind::ProviderFailure, reason);
                    return;
                }
                Ok(PollStatus::Processing) => {
                    debug!(job_id = %job.job_id, attempt = job.attempts, "Still processing");
                }
                Err(e) => {
                    warn!(
                        job_id = %job.job_id,
                        attempt = job.attempts,
                        error = %e,
                        "Status check failed, will retry"
                    );
                }
            }

            let elapsed = submitted_at.elapsed();
            if elapsed >= timeout {
                self.cancel_remote(job, handle).await;
                job.fail(
                    JobErrorKind::TimeoutError,
                    format!(
                        "no terminal status after {:.1}s ({} polls)",
                        elapsed.as_secs_f64(),
                        job.attempts
                    ),
                );
                return;
            }

            if *cancel.borrow() {
                self.cancel_remote(job, handle).await;
                job.fail(JobErrorKind::TimeoutError, "batch cancelled while polling");
                return;
            }

            // An interrupted wait falls through to one last status check.
            let wait = self.settings.poll_interval.min(timeout - elapsed);
            wait_or_cancel(wait, cancel).await;
        }
    }

    /// Fetch and store every artifact; any failure discards the whole set.
    async fn collect(
        &self,
        descriptor: &JobDescriptor,
        job: &mut Job,
        mut refs: Vec<ArtifactRef>,
        cancel: &mut watch::Receiver<bool>,
    ) {
        if refs.is_empty() {
            job.fail(
                JobErrorKind::ProviderFailure,
                "provider reported success without artifacts",
            );
            return;
        }

        let wanted = descriptor.num_outputs as usize;
        if refs.len() < wanted {
            warn!(
                job_id = %job.job_id,
                expected = wanted,
                returned = refs.len(),
                "Provider returned fewer artifacts than requested"
            );
        }
        refs.truncate(wanted);

        let mut saved: Vec<PathBuf> = Vec::with_capacity(refs.len());
        for (index, artifact_ref) in refs.iter().enumerate() {
            let artifact = match self.fetch(job, artifact_ref, cancel).await {
                Ok(artifact) => artifact,
                Err(e) => {
                    self.store.discard(&saved).await;
                    job.fail(
                        JobErrorKind::FetchError,
                        format!("artifact {} of {}: {e}", index + 1, refs.len()),
                    );
                    return;
                }
            };

            match self
                .store
                .upload(
                    &descriptor.id,
                    job.job_id,
                    index,
                    &artifact.bytes,
                    artifact.mime_type.as_deref(),
                )
                .await
            {
                Ok(path) => {
                    debug!(job_id = %job.job_id, path = %path.display(), "Artifact saved");
                    saved.push(path);
                }
                Err(e) => {
                    self.store.discard(&saved).await;
                    job.fail(JobErrorKind::FetchError, e.to_string());
                    return;
                }
            }
        }

        job.succeed(saved);
    }

    async fn fetch(
        &self,
        job: &Job,
        artifact_ref: &ArtifactRef,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Artifact, FetchError> {
        let policy = self.settings.fetch_retry;
        let mut retries = 0;

        loop {
            match self.provider.fetch(artifact_ref).await {
                Ok(artifact) => return Ok(artifact),
                Err(e) if e.is_retryable() && policy.allows(retries) => {
                    let delay = policy.delay_for(retries, None);
                    retries += 1;
                    warn!(
                        job_id = %job.job_id,
                        retry = retries,
                        error = %e,
                        "Artifact download failed, retrying"
                    );
                    if !wait_or_cancel(delay, cancel).await {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn cancel_remote(&self, job: &Job, handle: &ProviderHandle) {
        if let Err(e) = self.provider.cancel(handle).await {
            warn!(
                job_id = %job.job_id,
                provider_handle = %handle.id,
                error = %e,
                "Provider-side cancel failed; remote job may keep running"
            );
        }
    }
}
