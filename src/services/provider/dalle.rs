use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use uuid::Uuid;

use super::{
    check_submit_status, fetch_artifact, http_client, Artifact, ArtifactRef, FetchError, PollError,
    PollStatus, ProviderClient, ProviderConfigError, ProviderHandle, SubmissionError,
};
use crate::models::descriptor::JobDescriptor;
use crate::services::prompt;

const GENERATIONS_URL: &str = "https://api.openai.com/v1/images/generations";
const DEFAULT_MODEL: &str = "dall-e-3";
/// 9:16 portrait.
const DEFAULT_SIZE: &str = "1024x1792";

/// Client for OpenAI DALL-E image generation.
///
/// The API is synchronous: the generation finishes inside `submit` and the
/// returned URLs ride along on the handle.
pub struct DalleClient {
    http: Client,
    api_key: String,
    model: String,
    size: String,
}

#[derive(Deserialize)]
struct GenerationResponse {
    data: Vec<GeneratedImage>,
}

#[derive(Deserialize)]
struct GeneratedImage {
    url: Option<String>,
    b64_json: Option<String>,
}

impl DalleClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        size: Option<String>,
    ) -> Result<Self, ProviderConfigError> {
        Ok(Self {
            http: http_client()?,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            size: size.unwrap_or_else(|| DEFAULT_SIZE.to_string()),
        })
    }
}

#[async_trait]
impl ProviderClient for DalleClient {
    fn name(&self) -> &str {
        "dalle"
    }

    async fn submit(&self, descriptor: &JobDescriptor) -> Result<ProviderHandle, SubmissionError> {
        // dall-e-3 only generates one image per request
        let n = if self.model == DEFAULT_MODEL {
            1
        } else {
            descriptor.num_outputs
        };

        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt::compose(descriptor),
            "size": self.size,
            "quality": dalle_quality(&descriptor.quality_preset),
            "style": "natural",
            "n": n,
        });

        let response = self
            .http
            .post(GENERATIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = check_submit_status(response).await?;
        let generated: GenerationResponse = response.json().await?;

        let artifacts = collect_artifacts(generated);
        let status = if artifacts.is_empty() {
            PollStatus::Failed("DALL-E returned no images".to_string())
        } else {
            PollStatus::Ready(artifacts)
        };

        Ok(ProviderHandle::resolved(
            format!("dalle-{}", Uuid::new_v4()),
            status,
        ))
    }

    async fn poll(&self, handle: &ProviderHandle) -> Result<PollStatus, PollError> {
        handle.resolved_status()
    }

    async fn fetch(&self, artifact: &ArtifactRef) -> Result<Artifact, FetchError> {
        fetch_artifact(&self.http, artifact).await
    }
}

fn dalle_quality(preset: &str) -> &'static str {
    if preset.eq_ignore_ascii_case("hd") || preset.eq_ignore_ascii_case("high") {
        "hd"
    } else {
        "standard"
    }
}

fn collect_artifacts(response: GenerationResponse) -> Vec<ArtifactRef> {
    response
        .data
        .into_iter()
        .filter_map(|image| match (image.url, image.b64_json) {
            (Some(url), _) => Some(ArtifactRef::Url(url)),
            (None, Some(data)) => Some(ArtifactRef::Inline {
                mime_type: "image/png".to_string(),
                data,
            }),
            (None, None) => None,
        })
        .collect()
}
