//! Provider clients: one external generation backend each, behind the
//! uniform submit / poll / fetch contract the polling state machine drives.

pub mod dalle;
pub mod gemini;
pub mod kie;
pub mod replicate;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Response, StatusCode};
use strum::{Display, EnumString};

use crate::config::AppConfig;
use crate::models::descriptor::JobDescriptor;

pub use dalle::DalleClient;
pub use gemini::GeminiClient;
pub use kie::KieClient;
pub use replicate::ReplicateClient;

/// Request timeout applied to every provider HTTP call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Opaque reference to a submitted provider job.
///
/// Synchronous backends already know the outcome at submit time; they carry
/// it in `resolved` so the first poll reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderHandle {
    pub id: String,
    pub resolved: Option<PollStatus>,
}

impl ProviderHandle {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resolved: None,
        }
    }

    pub fn resolved(id: impl Into<String>, status: PollStatus) -> Self {
        Self {
            id: id.into(),
            resolved: Some(status),
        }
    }

    /// The outcome a synchronous backend recorded at submit time.
    pub(crate) fn resolved_status(&self) -> Result<PollStatus, PollError> {
        self.resolved
            .clone()
            .ok_or_else(|| PollError::Api(format!("handle {} carries no result", self.id)))
    }
}

/// Where a finished artifact can be retrieved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    Url(String),
    /// Base64 payload returned inline by the provider.
    Inline { mime_type: String, data: String },
}

/// Result of a single, non-blocking status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Processing,
    Ready(Vec<ArtifactRef>),
    Failed(String),
}

/// Bytes of one retrieved artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// Capability contract every backend implements.
///
/// Implementations hold no per-job state, so one instance serves the whole
/// batch. `poll` never sleeps; pacing belongs to the caller.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, descriptor: &JobDescriptor) -> Result<ProviderHandle, SubmissionError>;

    async fn poll(&self, handle: &ProviderHandle) -> Result<PollStatus, PollError>;

    async fn fetch(&self, artifact: &ArtifactRef) -> Result<Artifact, FetchError>;

    /// Best-effort provider-side cancellation. Most backends have none.
    async fn cancel(&self, _handle: &ProviderHandle) -> Result<(), PollError> {
        Ok(())
    }

    /// Remaining account credits, when the backend reports them.
    async fn credits(&self) -> Result<Option<u64>, PollError> {
        Ok(None)
    }
}

/// Backends selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(ascii_case_insensitive)]
pub enum ProviderKind {
    #[strum(to_string = "kie", serialize = "kie-nano-banana", serialize = "nano-banana")]
    Kie,
    #[strum(to_string = "dalle", serialize = "dall-e", serialize = "dall-e-3")]
    Dalle,
    #[strum(to_string = "sdxl", serialize = "stable-diffusion-xl", serialize = "replicate")]
    Sdxl,
    #[strum(to_string = "gemini", serialize = "imagen")]
    Gemini,
}

/// The configured backend, resolved once at batch start.
pub enum Provider {
    Kie(KieClient),
    Dalle(DalleClient),
    Sdxl(ReplicateClient),
    Gemini(GeminiClient),
}

impl Provider {
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderConfigError> {
        let kind: ProviderKind = config
            .provider
            .parse()
            .map_err(|_| ProviderConfigError::UnknownProvider(config.provider.clone()))?;

        let provider = match kind {
            ProviderKind::Kie => Provider::Kie(KieClient::new(
                require(&config.kie_api_key, "KIE_API_KEY")?,
                require(&config.imgbb_api_key, "IMGBB_API_KEY")?,
                config.kie_model.clone(),
            )?),
            ProviderKind::Dalle => Provider::Dalle(DalleClient::new(
                require(&config.openai_api_key, "OPENAI_API_KEY")?,
                config.dalle_model.clone(),
                config.dalle_size.clone(),
            )?),
            ProviderKind::Sdxl => Provider::Sdxl(ReplicateClient::new(
                require(&config.replicate_api_token, "REPLICATE_API_TOKEN")?,
                config.sdxl_version.clone(),
            )?),
            ProviderKind::Gemini => Provider::Gemini(GeminiClient::new(
                require(&config.gemini_api_key, "GEMINI_API_KEY")?,
                config.gemini_model.clone(),
            )?),
        };

        tracing::info!(provider = provider.name(), "Provider resolved");
        Ok(provider)
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::Kie(_) => ProviderKind::Kie,
            Provider::Dalle(_) => ProviderKind::Dalle,
            Provider::Sdxl(_) => ProviderKind::Sdxl,
            Provider::Gemini(_) => ProviderKind::Gemini,
        }
    }

    fn inner(&self) -> &dyn ProviderClient {
        match self {
            Provider::Kie(c) => c,
            Provider::Dalle(c) => c,
            Provider::Sdxl(c) => c,
            Provider::Gemini(c) => c,
        }
    }
}

#[async_trait]
impl ProviderClient for Provider {
    fn name(&self) -> &str {
        self.inner().name()
    }

    async fn submit(&self, descriptor: &JobDescriptor) -> Result<ProviderHandle, SubmissionError> {
        self.inner().submit(descriptor).await
    }

    async fn poll(&self, handle: &ProviderHandle) -> Result<PollStatus, PollError> {
        self.inner().poll(handle).await
    }

    async fn fetch(&self, artifact: &ArtifactRef) -> Result<Artifact, FetchError> {
        self.inner().fetch(artifact).await
    }

    async fn cancel(&self, handle: &ProviderHandle) -> Result<(), PollError> {
        self.inner().cancel(handle).await
    }

    async fn credits(&self) -> Result<Option<u64>, PollError> {
        self.inner().credits().await
    }
}

fn require(value: &Option<String>, name: &'static str) -> Result<String, ProviderConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ProviderConfigError::MissingCredential(name))
}

pub(crate) fn http_client() -> Result<Client, ProviderConfigError> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(ProviderConfigError::Http)
}

/// Map a submit response's HTTP status onto the submission taxonomy.
pub(crate) async fn check_submit_status(response: Response) -> Result<Response, SubmissionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(SubmissionError::RateLimited { retry_after });
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SubmissionError::Unauthorized(format!("{status}: {body}")));
    }
    Err(SubmissionError::Rejected(format!("{status}: {body}")))
}

/// Read a source image and return `(mime_type, base64 payload)`.
pub(crate) async fn encode_source_image(path: &Path) -> Result<(String, String), SubmissionError> {
    let bytes = tokio::fs::read(path).await?;
    let mime_type = image::guess_format(&bytes)
        .map(|f| f.to_mime_type().to_string())
        .unwrap_or_else(|_| "image/png".to_string());
    let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok((mime_type, data))
}

/// Retrieve an artifact reference with a plain HTTP GET or a base64 decode.
pub(crate) async fn fetch_artifact(http: &Client, artifact: &ArtifactRef) -> Result<Artifact, FetchError> {
    match artifact {
        ArtifactRef::Inline { mime_type, data } => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| FetchError::Decode(e.to_string()))?;
            Ok(Artifact {
                bytes,
                mime_type: Some(mime_type.clone()),
            })
        }
        ArtifactRef::Url(url) => {
            let response = http
                .get(url)
                .send()
                .await
                .map_err(|e| FetchError::Unreachable(e.to_string()))?;

            let status = response.status();
            if matches!(
                status,
                StatusCode::NOT_FOUND | StatusCode::GONE | StatusCode::FORBIDDEN
            ) {
                return Err(FetchError::Expired(format!("{status} for {url}")));
            }
            if !status.is_success() {
                return Err(FetchError::Unreachable(format!("{status} for {url}")));
            }

            let mime_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let bytes = response
                .bytes()
                .await
                .map_err(|e| FetchError::Unreachable(e.to_string()))?;

            if bytes.is_empty() {
                return Err(FetchError::Unreachable(format!("empty body for {url}")));
            }

            Ok(Artifact {
                bytes: bytes.to_vec(),
                mime_type,
            })
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("Provider rate limit hit")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Provider rejected request: {0}")]
    Rejected(String),

    #[error("HTTP request failed: {0}")]
    Http(reqwest::Error),

    #[error("Failed to read source image: {0}")]
    Io(#[from] std::io::Error),
}

// Request URLs may carry credentials, and these errors end up in the run log.
impl From<reqwest::Error> for SubmissionError {
    fn from(e: reqwest::Error) -> Self {
        SubmissionError::Http(e.without_url())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("HTTP request failed: {0}")]
    Http(reqwest::Error),

    #[error("Unexpected provider response: {0}")]
    Api(String),
}

impl From<reqwest::Error> for PollError {
    fn from(e: reqwest::Error) -> Self {
        PollError::Http(e.without_url())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Artifact reference expired: {0}")]
    Expired(String),

    #[error("Artifact unreachable: {0}")]
    Unreachable(String),

    #[error("Artifact payload could not be decoded: {0}")]
    Decode(String),
}

impl FetchError {
    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Unreachable(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderConfigError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("Failed to build HTTP client: {0}")]
    Http(reqwest::Error),
}
