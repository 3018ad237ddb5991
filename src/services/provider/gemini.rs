use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use uuid::Uuid;

use super::{
    check_submit_status, encode_source_image, fetch_artifact, http_client, Artifact, ArtifactRef,
    FetchError, PollError, PollStatus, ProviderClient, ProviderConfigError, ProviderHandle,
    SubmissionError,
};
use crate::models::descriptor::JobDescriptor;
use crate::services::prompt;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MODEL: &str = "gemini-2.0-flash-preview-image-generation";

/// Client for Gemini native image generation.
///
/// `generateContent` answers synchronously with inline base64 image parts.
pub struct GeminiClient {
    http: Client,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl GeminiClient {
    pub fn new(api_key: String, model: Option<String>) -> Result<Self, ProviderConfigError> {
        Ok(Self {
            http: http_client()?,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }

    /// The key travels in a header so it never appears in a request URL.
    fn generate_request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{API_BASE}/{}:generateContent", self.model))
            .header("x-goog-api-key", &self.api_key)
            .json(body)
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn submit(&self, descriptor: &JobDescriptor) -> Result<ProviderHandle, SubmissionError> {
        let (mime_type, encoded) = encode_source_image(&descriptor.source_image_path).await?;

        let body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": prompt::compose(descriptor) },
                    { "inline_data": { "mime_type": mime_type, "data": encoded } }
                ]
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
                "candidateCount": descriptor.num_outputs,
            }
        });

        let response = self.generate_request(&body).send().await?;
        let response = check_submit_status(response).await?;
        let generated: GenerateResponse = response.json().await?;

        let id = format!("gemini-{}", Uuid::new_v4());
        let status = match collect_images(generated) {
            Ok(artifacts) => PollStatus::Ready(artifacts),
            Err(reason) => PollStatus::Failed(reason),
        };
        Ok(ProviderHandle::resolved(id, status))
    }

    async fn poll(&self, handle: &ProviderHandle) -> Result<PollStatus, PollError> {
        handle.resolved_status()
    }

    async fn fetch(&self, artifact: &ArtifactRef) -> Result<Artifact, FetchError> {
        fetch_artifact(&self.http, artifact).await
    }
}

fn collect_images(response: GenerateResponse) -> Result<Vec<ArtifactRef>, String> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(format!("prompt blocked: {reason}"));
    }

    let artifacts: Vec<ArtifactRef> = response
        .candidates
        .into_iter()
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts)
        .filter_map(|p| p.inline_data)
        .filter(|d| d.mime_type.starts_with("image/"))
        .map(|d| ArtifactRef::Inline {
            mime_type: d.mime_type,
            data: d.data,
        })
        .collect();

    if artifacts.is_empty() {
        return Err("Gemini returned no image parts".to_string());
    }
    Ok(artifacts)
}
