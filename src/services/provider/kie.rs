use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use reqwest::Client;
use serde::Deserialize;

use super::{
    check_submit_status, fetch_artifact, http_client, Artifact, ArtifactRef, FetchError,
    PollError, PollStatus, ProviderClient, ProviderConfigError, ProviderHandle, SubmissionError,
};
use crate::models::descriptor::JobDescriptor;
use crate::services::prompt;
use crate::services::retry::RetryPolicy;

const BASE_URL: &str = "https://api.kie.ai/api/v1";
const IMGBB_URL: &str = "https://api.imgbb.com/1/upload";
const DEFAULT_MODEL: &str = "google/nano-banana-edit";

/// Reference images are shrunk to fit this box before publishing.
const UPLOAD_MAX_WIDTH: u32 = 1920;
const UPLOAD_MAX_HEIGHT: u32 = 1080;
const UPLOAD_JPEG_QUALITY: u8 = 90;

/// Client for Kie.ai Nano Banana image editing.
///
/// Nano Banana only accepts reference images by public URL, so the source
/// image is published to imgbb first.
pub struct KieClient {
    http: Client,
    api_key: String,
    imgbb_api_key: String,
    model: String,
    upload_retry: RetryPolicy,
}

/// Envelope every Kie.ai endpoint answers with.
#[derive(Deserialize)]
struct KieEnvelope<T> {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

impl<T> KieEnvelope<T> {
    fn error_message(&self) -> String {
        self.msg
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| format!("code {}", self.code))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskData {
    task_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordInfo {
    state: Option<String>,
    result_json: Option<serde_json::Value>,
    fail_msg: Option<String>,
    #[serde(default)]
    result_urls: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultJson {
    #[serde(default)]
    result_urls: Vec<String>,
}

#[derive(Deserialize)]
struct CreditsData {
    credits: u64,
}

#[derive(Deserialize)]
struct ImgbbResponse {
    success: bool,
    data: Option<ImgbbData>,
}

#[derive(Deserialize)]
struct ImgbbData {
    url: String,
}

impl KieClient {
    pub fn new(
        api_key: String,
        imgbb_api_key: String,
        model: Option<String>,
    ) -> Result<Self, ProviderConfigError> {
        Ok(Self {
            http: http_client()?,
            api_key,
            imgbb_api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            // three attempts, two seconds apart
            upload_retry: RetryPolicy::new(2, Duration::from_secs(2), Duration::from_secs(2)),
        })
    }

    /// Publish the source image and return its public URL.
    ///
    /// Transport failures are retried; anything imgbb answers is final.
    async fn upload_reference(&self, descriptor: &JobDescriptor) -> Result<String, SubmissionError> {
        let original = tokio::fs::read(&descriptor.source_image_path).await?;
        let bytes = match tokio::task::spawn_blocking({
            let original = original.clone();
            move || shrink_for_upload(&original)
        })
        .await
        {
            Ok(Ok(resized)) => {
                tracing::debug!(
                    descriptor_id = %descriptor.id,
                    original_kb = original.len() / 1024,
                    resized_kb = resized.len() / 1024,
                    "Reference image re-encoded for upload"
                );
                resized
            }
            Ok(Err(e)) => {
                tracing::warn!(descriptor_id = %descriptor.id, error = %e, "Resize failed, uploading original");
                original
            }
            Err(e) => {
                tracing::warn!(descriptor_id = %descriptor.id, error = %e, "Resize task failed, uploading original");
                original
            }
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);

        let mut retries = 0;
        loop {
            match self.post_to_imgbb(&encoded).await {
                Err(e) if is_transient(&e) && self.upload_retry.allows(retries) => {
                    let delay = self.upload_retry.delay_for(retries, None);
                    retries += 1;
                    tracing::warn!(
                        descriptor_id = %descriptor.id,
                        retry = retries,
                        error = %e,
                        "imgbb upload failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    async fn post_to_imgbb(&self, encoded: &str) -> Result<String, SubmissionError> {
        let form = reqwest::multipart::Form::new()
            .text("key", self.imgbb_api_key.clone())
            .text("image", encoded.to_string());

        let response = self.http.post(IMGBB_URL).multipart(form).send().await?;
        let response = check_submit_status(response).await?;
        let body: ImgbbResponse = response.json().await?;

        match body.data {
            Some(data) if body.success => Ok(data.url),
            _ => Err(SubmissionError::Rejected(
                "imgbb did not return an image URL".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ProviderClient for KieClient {
    fn name(&self) -> &str {
        "kie"
    }

    async fn submit(&self, descriptor: &JobDescriptor) -> Result<ProviderHandle, SubmissionError> {
        let reference_url = self.upload_reference(descriptor).await?;
        tracing::debug!(descriptor_id = %descriptor.id, url = %reference_url, "Reference image published");

        let body = serde_json::json!({
            "model": self.model,
            "input": {
                "prompt": prompt::compose(descriptor),
                "image_urls": [reference_url],
                "output_format": "png",
                "image_size": "9:16",
                "num_images": descriptor.num_outputs,
            }
        });

        let response = self
            .http
            .post(format!("{BASE_URL}/jobs/createTask"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = check_submit_status(response).await?;
        let envelope: KieEnvelope<CreateTaskData> = response.json().await?;

        parse_create_task(envelope)
    }

    async fn poll(&self, handle: &ProviderHandle) -> Result<PollStatus, PollError> {
        let response = self
            .http
            .get(format!("{BASE_URL}/playground/recordInfo"))
            .query(&[("taskId", handle.id.as_str())])
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?;

        let envelope: KieEnvelope<RecordInfo> = response.json().await?;
        parse_record_info(envelope)
    }

    async fn fetch(&self, artifact: &ArtifactRef) -> Result<Artifact, FetchError> {
        fetch_artifact(&self.http, artifact).await
    }

    async fn credits(&self) -> Result<Option<u64>, PollError> {
        let response = self
            .http
            .get(format!("{BASE_URL}/user/credits"))
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?;

        let envelope: KieEnvelope<serde_json::Value> = response.json().await?;
        if envelope.code != 200 {
            return Err(PollError::Api(envelope.error_message()));
        }
        Ok(envelope.data.and_then(parse_credits))
    }
}

fn parse_create_task(envelope: KieEnvelope<CreateTaskData>) -> Result<ProviderHandle, SubmissionError> {
    match envelope.code {
        200 => envelope
            .data
            .map(|d| ProviderHandle::pending(d.task_id))
            .ok_or_else(|| SubmissionError::Rejected("createTask returned no taskId".to_string())),
        429 => Err(SubmissionError::RateLimited { retry_after: None }),
        401 | 403 => Err(SubmissionError::Unauthorized(envelope.error_message())),
        _ => Err(SubmissionError::Rejected(envelope.error_message())),
    }
}

fn parse_record_info(envelope: KieEnvelope<RecordInfo>) -> Result<PollStatus, PollError> {
    if envelope.code != 200 {
        return Err(PollError::Api(envelope.error_message()));
    }
    let Some(info) = envelope.data else {
        return Err(PollError::Api("recordInfo returned no data".to_string()));
    };

    match info.state.as_deref() {
        Some("success") => {
            let mut urls = match info.result_json {
                Some(serde_json::Value::String(raw)) => serde_json::from_str::<ResultJson>(&raw)
                    .map(|r| r.result_urls)
                    .unwrap_or_default(),
                Some(value) => serde_json::from_value::<ResultJson>(value)
                    .map(|r| r.result_urls)
                    .unwrap_or_default(),
                None => Vec::new(),
            };
            if urls.is_empty() {
                urls = info.result_urls;
            }
            Ok(PollStatus::Ready(urls.into_iter().map(ArtifactRef::Url).collect()))
        }
        Some("fail") => Ok(PollStatus::Failed(
            info.fail_msg.unwrap_or_else(|| "Unknown error".to_string()),
        )),
        _ => Ok(PollStatus::Processing),
    }
}

fn is_transient(error: &SubmissionError) -> bool {
    matches!(error, SubmissionError::Http(_))
}

/// Fit the image inside the upload box and re-encode it as JPEG.
///
/// Never upscales. Transparent areas are flattened onto white.
fn shrink_for_upload(bytes: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let mut img = image::load_from_memory(bytes)?;
    if img.width() > UPLOAD_MAX_WIDTH || img.height() > UPLOAD_MAX_HEIGHT {
        img = img.resize(UPLOAD_MAX_WIDTH, UPLOAD_MAX_HEIGHT, FilterType::Lanczos3);
    }

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, UPLOAD_JPEG_QUALITY)
        .encode_image(&flatten_on_white(&img))?;
    Ok(out)
}

fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| ((c as u16 * a as u16 + 255 * (255 - a as u16)) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

fn parse_credits(data: serde_json::Value) -> Option<u64> {
    match data {
        serde_json::Value::Number(n) => n.as_u64(),
        other => serde_json::from_value::<CreditsData>(other).ok().map(|d| d.credits),
    }
}
