use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{
    check_submit_status, encode_source_image, fetch_artifact, http_client, Artifact, ArtifactRef,
    FetchError, PollError, PollStatus, ProviderClient, ProviderConfigError, ProviderHandle,
    SubmissionError,
};
use crate::models::descriptor::JobDescriptor;
use crate::services::prompt;

const PREDICTIONS_URL: &str = "https://api.replicate.com/v1/predictions";
const DEFAULT_VERSION: &str = "7762fd07cf82c948538e41f63f77d685e02b063e37e496e96eefd46c929f9bdc";
const NEGATIVE_PROMPT: &str = "blurry, wrong product, different product, distorted perspective, \
    cartoon, painting, cropped product, deformed face, bad anatomy, extra limbs";

/// Client for Stable Diffusion XL img2img on Replicate.
pub struct ReplicateClient {
    http: Client,
    api_token: String,
    version: String,
}

#[derive(Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

impl ReplicateClient {
    pub fn new(api_token: String, version: Option<String>) -> Result<Self, ProviderConfigError> {
        Ok(Self {
            http: http_client()?,
            api_token,
            version: version.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        })
    }
}

#[async_trait]
impl ProviderClient for ReplicateClient {
    fn name(&self) -> &str {
        "sdxl"
    }

    async fn submit(&self, descriptor: &JobDescriptor) -> Result<ProviderHandle, SubmissionError> {
        let (mime_type, encoded) = encode_source_image(&descriptor.source_image_path).await?;

        let body = serde_json::json!({
            "version": self.version,
            "input": {
                "image": format!("data:{mime_type};base64,{encoded}"),
                "prompt": prompt::compose(descriptor),
                "negative_prompt": NEGATIVE_PROMPT,
                "prompt_strength": 0.55,
                "guidance_scale": 12.0,
                "num_inference_steps": 50,
                "refine": "no_refiner",
                "scheduler": "K_EULER_ANCESTRAL",
                "width": 768,
                "height": 1344,
                "num_outputs": descriptor.num_outputs,
            }
        });

        let response = self
            .http
            .post(PREDICTIONS_URL)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;
        let response = check_submit_status(response).await?;
        let prediction: Prediction = response.json().await?;

        Ok(ProviderHandle::pending(prediction.id))
    }

    async fn poll(&self, handle: &ProviderHandle) -> Result<PollStatus, PollError> {
        let prediction: Prediction = self
            .http
            .get(format!("{PREDICTIONS_URL}/{}", handle.id))
            .bearer_auth(&self.api_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(prediction_status(prediction))
    }

    async fn fetch(&self, artifact: &ArtifactRef) -> Result<Artifact, FetchError> {
        fetch_artifact(&self.http, artifact).await
    }

    async fn cancel(&self, handle: &ProviderHandle) -> Result<(), PollError> {
        self.http
            .post(format!("{PREDICTIONS_URL}/{}/cancel", handle.id))
            .bearer_auth(&self.api_token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn prediction_status(prediction: Prediction) -> PollStatus {
    match prediction.status.as_str() {
        "succeeded" => {
            let urls = match prediction.output {
                Some(serde_json::Value::String(url)) => vec![url],
                Some(serde_json::Value::Array(items)) => items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };
            PollStatus::Ready(urls.into_iter().map(ArtifactRef::Url).collect())
        }
        "failed" => PollStatus::Failed(
            prediction
                .error
                .map(|e| match e {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "prediction failed".to_string()),
        ),
        "canceled" => PollStatus::Failed("prediction canceled".to_string()),
        _ => PollStatus::Processing,
    }
}
