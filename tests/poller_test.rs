//! Single-job state machine runs against a scripted provider

mod fixtures;
mod helpers;

use std::sync::Arc;
use std::time::Duration;

use fixtures::*;
use helpers::*;
use product_visualizer::models::job::{JobErrorKind, JobState};
use product_visualizer::services::aggregator::Aggregator;
use product_visualizer::services::poller::{JobRunner, PollSettings};
use product_visualizer::services::retry::RetryPolicy;
use product_visualizer::services::storage::ArtifactStore;
use tokio::sync::watch;

fn runner(provider: MockProvider, output: &std::path::Path) -> JobRunner {
    JobRunner::new(
        Arc::new(provider),
        Arc::new(ArtifactStore::new(output.join("images"))),
        PollSettings {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(60),
            rate_limit: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
            fetch_retry: RetryPolicy::none(),
        },
    )
}

#[tokio::test]
async fn test_successful_job_visits_every_state_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(
        MockProvider::new(Script::ReadyAfter {
            polls: 3,
            artifacts: 1,
        }),
        dir.path(),
    );
    let aggregator = Aggregator::new("mock");
    let (_tx, rx) = watch::channel(false);

    let job = runner
        .run(&descriptor(dir.path(), "shoe"), &aggregator, rx)
        .await;

    assert_eq!(
        job.transitions(),
        &[
            JobState::Pending,
            JobState::Submitted,
            JobState::Polling,
            JobState::Succeeded
        ]
    );
    assert_eq!(job.attempts, 3);
    assert_eq!(job.artifacts.len(), 1);
    assert!(job.error.is_none());
    assert!(job.provider_handle.as_deref().unwrap().starts_with("mock-"));
    assert!(job.elapsed > Duration::ZERO);
}

#[tokio::test]
async fn test_validation_failure_goes_straight_to_failed() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(MockProvider::new(Script::ready()), dir.path());
    let aggregator = Aggregator::new("mock");
    let (_tx, rx) = watch::channel(false);

    let job = runner
        .run(&missing_source(dir.path(), "gone"), &aggregator, rx)
        .await;

    assert_eq!(job.transitions(), &[JobState::Pending, JobState::Failed]);
    assert_eq!(job.error.unwrap().kind, JobErrorKind::ValidationError);
    assert_eq!(job.elapsed, Duration::ZERO);
}

#[tokio::test]
async fn test_timeout_ends_in_timed_out() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(MockProvider::new(Script::Never), dir.path());
    let aggregator = Aggregator::new("mock");
    let (_tx, rx) = watch::channel(false);

    let job = runner
        .run(&descriptor(dir.path(), "stuck"), &aggregator, rx)
        .await;

    assert_eq!(job.state, JobState::TimedOut);
    assert_eq!(job.previous_state(), JobState::Polling);
    assert_eq!(job.error.unwrap().kind, JobErrorKind::TimeoutError);
    assert!(job.elapsed >= Duration::from_millis(60));
    assert!(job.artifacts.is_empty());
}

#[tokio::test]
async fn test_cancel_during_backoff_fails_before_submission() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new(Script::RateLimited { times: 5 });
    let runner = JobRunner::new(
        Arc::new(provider),
        Arc::new(ArtifactStore::new(dir.path().join("images"))),
        PollSettings {
            rate_limit: RetryPolicy::new(5, Duration::from_secs(10), Duration::from_secs(10)),
            ..PollSettings::default()
        },
    );
    let aggregator = Aggregator::new("mock");
    let (tx, rx) = watch::channel(false);

    let busy = descriptor(dir.path(), "busy");
    let run = runner.run(&busy, &aggregator, rx);
    let trigger = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
    };
    let (job, ()) = tokio::join!(run, trigger);

    assert_eq!(job.transitions(), &[JobState::Pending, JobState::Failed]);
    assert_eq!(job.error.unwrap().kind, JobErrorKind::Cancelled);
    assert!(job.provider_handle.is_none());
}

#[tokio::test]
async fn test_cancelled_batch_does_not_submit() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(Script::ready()));
    let runner = JobRunner::new(
        provider.clone(),
        Arc::new(ArtifactStore::new(dir.path().join("images"))),
        PollSettings::default(),
    );
    let aggregator = Aggregator::new("mock");
    let (_tx, rx) = watch::channel(true);

    let job = runner
        .run(&descriptor(dir.path(), "late"), &aggregator, rx)
        .await;

    assert_eq!(job.transitions(), &[JobState::Pending, JobState::Failed]);
    assert_eq!(job.error.unwrap().kind, JobErrorKind::Cancelled);
    assert_eq!(provider.submits(), 0);
}
