//! Volcengine Ark video generation (Seedance).
//!
//! Seedance is token-metered: the reservation is a per-call estimate and
//! the final charge is settled from `usage.total_tokens` on success.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{
    api_base, api_key, media_url, send, Platform, PreparedRequest, ProviderError, RawPoll,
    SubmitContext, Submission, TaskAdaptor, VideoRequest,
};
use crate::account::Channel;
use crate::billing::BillingHints;
use crate::error::GatewayError;
use crate::task::{PollResult, TaskAction, TaskStatus};

const MODELS: &[&str] = &[
    "doubao-seedance-1-0-pro-250528",
    "doubao-seedance-1-0-lite-t2v-250428",
    "doubao-seedance-1-0-lite-i2v-250428",
    "doubao-seedance-1-5-pro-251215",
    "wan2-1-14b-t2v-250428",
    "wan2-1-14b-i2v-250428",
];

/// Request parameters forwarded verbatim when present, either top-level
/// or under `metadata`.
const PASSTHROUGH_PARAMS: &[&str] = &[
    "resolution",
    "ratio",
    "duration",
    "frames",
    "seed",
    "camera_fixed",
    "draft",
    "service_tier",
    "execution_expires_after",
    "callback_url",
    "return_last_frame",
];

#[derive(Debug, Serialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_url: Option<ImageUrl>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct FetchResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    content: Option<FetchContent>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct FetchContent {
    #[serde(default)]
    video_url: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: i64,
}

pub struct VolcAdaptor {
    client: Client,
}

impl VolcAdaptor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn build_body(request: &VideoRequest, model: &str) -> Value {
        let mut content = Vec::new();
        if !request.prompt.trim().is_empty() {
            content.push(ContentItem {
                kind: "text",
                text: Some(request.prompt.clone()),
                image_url: None,
                role: None,
            });
        }

        let default_role = request
            .metadata
            .get("role")
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty())
            .unwrap_or("first_frame");
        if let Some(url) = request.image.as_ref().and_then(media_url) {
            content.push(image_item(url, default_role));
        }

        let metadata_images = request
            .metadata
            .get("images")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for image in request.images.iter().chain(metadata_images) {
            let Some(url) = media_url(image) else {
                continue;
            };
            let role = image
                .get("role")
                .and_then(Value::as_str)
                .filter(|r| !r.is_empty())
                .unwrap_or("first_frame");
            content.push(image_item(url, role));
        }

        let mut body = Map::new();
        body.insert("model".into(), json!(model));
        body.insert("content".into(), json!(content));

        for key in PASSTHROUGH_PARAMS {
            let value = match *key {
                "resolution" => request.resolution.clone().map(Value::String),
                "duration" => request.duration.clone(),
                _ => request.extra.get(*key).cloned(),
            }
            .or_else(|| request.metadata.get(*key).cloned());
            if let Some(value) = value.filter(|v| !v.is_null()) {
                body.insert((*key).to_string(), value);
            }
        }
        if let Some(ratio) = &request.aspect_ratio {
            body.entry("ratio").or_insert_with(|| json!(ratio));
        }

        // Ark defaults to a watermark and no audio unless told otherwise.
        for (key, default) in [("watermark", false), ("generate_audio", false)] {
            let value = request
                .extra
                .get(key)
                .or_else(|| request.metadata.get(key))
                .and_then(Value::as_bool)
                .unwrap_or(default);
            body.insert(key.to_string(), json!(value));
        }

        Value::Object(body)
    }
}

fn image_item(url: String, role: &str) -> ContentItem {
    ContentItem {
        kind: "image_url",
        text: None,
        image_url: Some(ImageUrl { url }),
        role: Some(role.to_string()),
    }
}

#[async_trait]
impl TaskAdaptor for VolcAdaptor {
    fn platform(&self) -> Platform {
        Platform::Volc
    }

    fn models(&self) -> &'static [&'static str] {
        MODELS
    }

    fn validate_and_prepare(
        &self,
        request: VideoRequest,
        ctx: &SubmitContext<'_>,
    ) -> Result<PreparedRequest, GatewayError> {
        if ctx.action != TaskAction::Generate {
            return Err(GatewayError::validation(
                "invalid_request",
                format!("{} is not supported for this platform", ctx.action),
            ));
        }
        if request.model_name().is_none() {
            return Err(GatewayError::validation("invalid_request", "model is required"));
        }
        if request.prompt.trim().is_empty() && !request.has_image() {
            return Err(GatewayError::validation(
                "invalid_request",
                "prompt or image is required",
            ));
        }

        Ok(PreparedRequest {
            action: TaskAction::Generate,
            hints: BillingHints::default(),
            seconds: request.requested_seconds(),
            size: request.resolution.clone(),
            remix_of: None,
            request,
        })
    }

    async fn submit(
        &self,
        channel: &Channel,
        prepared: &PreparedRequest,
        upstream_model: &str,
    ) -> Result<Submission, ProviderError> {
        let url = format!("{}/api/v3/contents/generations/tasks", api_base(channel));
        let body = Self::build_body(&prepared.request, upstream_model);

        let raw = send(
            self.client
                .post(&url)
                .bearer_auth(api_key(channel))
                .header("Accept", "application/json")
                .json(&body),
        )
        .await?;

        let parsed: Option<SubmitResponse> = serde_json::from_str(&raw.body).ok();
        if let Some(ApiError { code, message }) = parsed.as_ref().and_then(|p| p.error.as_ref()) {
            if !code.is_empty() {
                let mut err = ProviderError::from_status(raw.status.max(400), &raw.body);
                err.message = format!("{}: {}", code, message);
                return Err(err);
            }
        }
        if !(200..300).contains(&raw.status) {
            return Err(ProviderError::from_status(raw.status, &raw.body));
        }
        match parsed {
            Some(SubmitResponse { id, .. }) if !id.is_empty() => Ok(Submission {
                task_id: id,
                body: raw.body,
            }),
            _ => Err(ProviderError::parse_error(format!(
                "empty task id, response: {}",
                raw.body
            ))),
        }
    }

    async fn poll(&self, channel: &Channel, task_id: &str) -> Result<RawPoll, ProviderError> {
        let url = format!(
            "{}/api/v3/contents/generations/tasks/{}",
            api_base(channel),
            task_id
        );
        let raw = send(
            self.client
                .get(&url)
                .bearer_auth(api_key(channel))
                .header("Accept", "application/json"),
        )
        .await?;
        match raw.status {
            404 => Ok(RawPoll {
                status: 200,
                body: r#"{"status":"expired"}"#.to_string(),
            }),
            // Ark error bodies carry the failure reason. Auth and timeout
            // statuses stay errors so the task is retried.
            200..=299 | 400 | 422 => Ok(raw),
            status => Err(ProviderError::from_status(status, &raw.body)),
        }
    }

    fn normalize(&self, raw: &RawPoll) -> Result<PollResult, ProviderError> {
        let parsed: FetchResponse = serde_json::from_str(&raw.body)
            .map_err(|e| ProviderError::parse_error(format!("unmarshal task result failed: {}", e)))?;

        let mut result = PollResult {
            model: parsed.model,
            ..Default::default()
        };

        if let Some(error) = parsed.error.as_ref().filter(|e| !e.code.is_empty()) {
            if parsed.status.is_empty() {
                result.status = Some(TaskStatus::Failure);
                result.progress = Some("100%".into());
                result.reason = Some(format!("{}: {}", error.code, error.message));
                return Ok(result);
            }
        }

        match parsed.status.to_ascii_lowercase().as_str() {
            "queued" => {
                result.status = Some(TaskStatus::Queued);
                result.progress = Some("20%".into());
            }
            "running" => {
                result.status = Some(TaskStatus::InProgress);
                result.progress = Some("60%".into());
            }
            "succeeded" => {
                result.status = Some(TaskStatus::Success);
                result.progress = Some("100%".into());
                result.result_url = parsed
                    .content
                    .map(|c| c.video_url)
                    .filter(|u| !u.is_empty());
                result.total_tokens = parsed.usage.map(|u| u.total_tokens).filter(|t| *t > 0);
                result.duration = parsed.duration.filter(|d| *d > 0.0);
            }
            "failed" => {
                result.status = Some(TaskStatus::Failure);
                result.progress = Some("100%".into());
                result.reason = Some(
                    parsed
                        .error
                        .map(|e| e.message)
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| "task failed".to_string()),
                );
            }
            "expired" => {
                result.status = Some(TaskStatus::Failure);
                result.progress = Some("100%".into());
                result.reason = Some("task expired".to_string());
            }
            other => {
                if !other.is_empty() {
                    tracing::warn!("Unrecognized Ark task status: {}", other);
                }
            }
        }
        Ok(result)
    }
}
