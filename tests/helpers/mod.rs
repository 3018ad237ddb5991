//! Scripted in-process provider for dispatcher and poller tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use product_visualizer::models::descriptor::JobDescriptor;
use product_visualizer::services::aggregator::Aggregator;
use product_visualizer::services::dispatcher::{DispatchSettings, Dispatcher};
use product_visualizer::services::provider::{
    Artifact, ArtifactRef, FetchError, PollError, PollStatus, ProviderClient, ProviderHandle,
    SubmissionError,
};
use product_visualizer::services::retry::RetryPolicy;
use product_visualizer::services::storage::ArtifactStore;

use crate::fixtures::PNG_BYTES;

/// How the mock answers for one descriptor.
#[derive(Debug, Clone)]
pub enum Script {
    /// Processing until the given poll (1-based), then that many artifacts.
    ReadyAfter { polls: u32, artifacts: usize },
    /// Processing until the given poll, then a provider-side failure.
    FailAfter { polls: u32, reason: &'static str },
    /// Processing forever.
    Never,
    /// `times` rate-limit responses, then accepted and ready on the first poll.
    RateLimited { times: u32 },
    /// Submission refused outright.
    Reject(&'static str),
    /// Ready with `artifacts` refs, the last of which has expired.
    ExpiredArtifact { artifacts: usize },
    /// Status checks error out until the given poll, then one artifact.
    FlakyPolls { errors: u32 },
    /// Accepted, then the first status check panics.
    PanicOnPoll,
}

impl Script {
    pub fn ready() -> Self {
        Script::ReadyAfter {
            polls: 1,
            artifacts: 1,
        }
    }
}

struct Remote {
    descriptor_id: String,
    polls: u32,
    open: bool,
}

pub struct MockProvider {
    default: Script,
    scripts: HashMap<String, Script>,
    latency: Duration,
    credits: Option<u64>,
    remote: Mutex<HashMap<String, Remote>>,
    rate_limited: Mutex<HashMap<String, u32>>,
    pub submit_calls: AtomicUsize,
    pub poll_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
    open_remote: AtomicUsize,
    pub peak_open_remote: AtomicUsize,
}

impl MockProvider {
    pub fn new(default: Script) -> Self {
        Self {
            default,
            scripts: HashMap::new(),
            latency: Duration::from_millis(5),
            credits: None,
            remote: Mutex::new(HashMap::new()),
            rate_limited: Mutex::new(HashMap::new()),
            submit_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            open_remote: AtomicUsize::new(0),
            peak_open_remote: AtomicUsize::new(0),
        }
    }

    pub fn script(mut self, descriptor_id: &str, script: Script) -> Self {
        self.scripts.insert(descriptor_id.to_string(), script);
        self
    }

    /// Delay applied to every call, so concurrent jobs overlap.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn credits(mut self, credits: u64) -> Self {
        self.credits = Some(credits);
        self
    }

    pub fn submits(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    fn script_for(&self, descriptor_id: &str) -> Script {
        self.scripts
            .get(descriptor_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    fn close(&self, handle_id: &str) {
        if let Some(remote) = self.remote.lock().get_mut(handle_id) {
            if remote.open {
                remote.open = false;
                self.open_remote.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn refs(descriptor_id: &str, count: usize, expire_last: bool) -> Vec<ArtifactRef> {
        (0..count)
            .map(|i| {
                let scheme = if expire_last && i + 1 == count {
                    "expired"
                } else {
                    "mock"
                };
                ArtifactRef::Url(format!("{scheme}://{descriptor_id}/{i}"))
            })
            .collect()
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn submit(&self, descriptor: &JobDescriptor) -> Result<ProviderHandle, SubmissionError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;

        match self.script_for(&descriptor.id) {
            Script::Reject(reason) => return Err(SubmissionError::Rejected(reason.to_string())),
            Script::RateLimited { times } => {
                let mut seen = self.rate_limited.lock();
                let count = seen.entry(descriptor.id.clone()).or_insert(0);
                if *count < times {
                    *count += 1;
                    return Err(SubmissionError::RateLimited { retry_after: None });
                }
            }
            _ => {}
        }

        let handle_id = format!("mock-{}", uuid::Uuid::new_v4());
        self.remote.lock().insert(
            handle_id.clone(),
            Remote {
                descriptor_id: descriptor.id.clone(),
                polls: 0,
                open: true,
            },
        );
        let open = self.open_remote.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_open_remote.fetch_max(open, Ordering::SeqCst);

        Ok(ProviderHandle::pending(handle_id))
    }

    async fn poll(&self, handle: &ProviderHandle) -> Result<PollStatus, PollError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;

        let (descriptor_id, polls) = {
            let mut remote = self.remote.lock();
            let entry = remote
                .get_mut(&handle.id)
                .ok_or_else(|| PollError::Api(format!("unknown handle {}", handle.id)))?;
            entry.polls += 1;
            (entry.descriptor_id.clone(), entry.polls)
        };

        let status = match self.script_for(&descriptor_id) {
            Script::ReadyAfter {
                polls: ready_at,
                artifacts,
            } if polls >= ready_at => PollStatus::Ready(Self::refs(&descriptor_id, artifacts, false)),
            Script::FailAfter {
                polls: fail_at,
                reason,
            } if polls >= fail_at => PollStatus::Failed(reason.to_string()),
            Script::RateLimited { .. } => PollStatus::Ready(Self::refs(&descriptor_id, 1, false)),
            Script::ExpiredArtifact { artifacts } => {
                PollStatus::Ready(Self::refs(&descriptor_id, artifacts, true))
            }
            Script::PanicOnPoll => panic!("mock provider crashed polling {descriptor_id}"),
            Script::FlakyPolls { errors } => {
                if polls <= errors {
                    return Err(PollError::Api("gateway timeout".to_string()));
                }
                PollStatus::Ready(Self::refs(&descriptor_id, 1, false))
            }
            _ => PollStatus::Processing,
        };

        if !matches!(status, PollStatus::Processing) {
            self.close(&handle.id);
        }
        Ok(status)
    }

    async fn fetch(&self, artifact: &ArtifactRef) -> Result<Artifact, FetchError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        match artifact {
            ArtifactRef::Url(url) if url.starts_with("expired://") => {
                Err(FetchError::Expired(url.clone()))
            }
            _ => Ok(Artifact {
                bytes: PNG_BYTES.to_vec(),
                mime_type: Some("image/png".to_string()),
            }),
        }
    }

    async fn cancel(&self, handle: &ProviderHandle) -> Result<(), PollError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.close(&handle.id);
        Ok(())
    }

    async fn credits(&self) -> Result<Option<u64>, PollError> {
        Ok(self.credits)
    }
}

/// Fast settings: short polls, no real backoff.
pub fn fast_settings(max_workers: usize) -> DispatchSettings {
    DispatchSettings {
        max_workers,
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_millis(500),
        rate_limit: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        fetch_retry: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(5)),
        max_consecutive_failures: 0,
    }
}

/// Everything a dispatcher test needs, wired to one mock and one temp dir.
pub struct Harness {
    pub provider: Arc<MockProvider>,
    pub aggregator: Arc<Aggregator>,
    pub dispatcher: Dispatcher,
    pub cancel_tx: watch::Sender<bool>,
    pub cancel_rx: watch::Receiver<bool>,
    pub output: tempfile::TempDir,
}

impl Harness {
    pub fn new(provider: MockProvider, settings: DispatchSettings) -> Self {
        let provider = Arc::new(provider);
        let output = tempfile::tempdir().expect("output dir");
        let store = Arc::new(ArtifactStore::new(output.path().join("images")));
        let dispatcher = Dispatcher::new(provider.clone(), store, settings);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        Self {
            provider,
            aggregator: Arc::new(Aggregator::new("mock")),
            dispatcher,
            cancel_tx,
            cancel_rx,
            output,
        }
    }

    /// Files currently in the artifact directory.
    pub fn stored_files(&self) -> Vec<std::path::PathBuf> {
        match std::fs::read_dir(self.output.path().join("images")) {
            Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(_) => Vec::new(),
        }
    }
}
