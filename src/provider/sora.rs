//! OpenAI-style video API (`sora-2`): create, remix and retrieve.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{
    api_base, api_key, send, OpenAiVideo, Platform, PreparedRequest, ProviderError, RawPoll,
    SubmitContext, Submission, TaskAdaptor, VideoRequest,
};
use crate::account::Channel;
use crate::billing::BillingHints;
use crate::error::GatewayError;
use crate::task::{PollResult, Task, TaskAction, TaskStatus};

const MODELS: &[&str] = &["sora-2", "sora-2-pro"];

const DEFAULT_SECONDS: f64 = 4.0;
const LARGE_SIZE_RATIO: f64 = 1.666667;
const LARGE_SIZES: &[&str] = &["1792x1024", "1024x1792"];

#[derive(Debug, Deserialize)]
struct VideoResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    seconds: Option<Value>,
    #[serde(default)]
    error: Option<VideoResponseError>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct VideoResponseError {
    #[serde(default)]
    message: String,
}

pub struct SoraAdaptor {
    client: Client,
}

impl SoraAdaptor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn size_ratio(size: Option<&str>) -> f64 {
    match size {
        Some(s) if LARGE_SIZES.contains(&s) => LARGE_SIZE_RATIO,
        _ => 1.0,
    }
}

#[async_trait]
impl TaskAdaptor for SoraAdaptor {
    fn platform(&self) -> Platform {
        Platform::Sora
    }

    fn models(&self) -> &'static [&'static str] {
        MODELS
    }

    fn validate_and_prepare(
        &self,
        request: VideoRequest,
        ctx: &SubmitContext<'_>,
    ) -> Result<PreparedRequest, GatewayError> {
        if request.prompt.trim().is_empty() {
            return Err(GatewayError::validation("invalid_request", "prompt is required"));
        }
        if ctx.action == TaskAction::Edit {
            return Err(GatewayError::validation(
                "invalid_request",
                "edit is not supported for this platform",
            ));
        }

        let (seconds, size, remix_of) = match (ctx.action, ctx.origin) {
            (TaskAction::Remix, Some(origin)) => (
                origin.properties.seconds.unwrap_or(DEFAULT_SECONDS),
                origin.properties.size.clone(),
                Some(origin.task_id.clone()),
            ),
            (TaskAction::Remix, None) => {
                return Err(GatewayError::validation(
                    "invalid_request",
                    "remix requires an origin video",
                ))
            }
            _ => (
                request.requested_seconds().unwrap_or(DEFAULT_SECONDS),
                request.size.clone(),
                None,
            ),
        };

        let mut hints = BillingHints::default().ratio("seconds", seconds);
        let ratio = size_ratio(size.as_deref());
        if ratio != 1.0 {
            hints = hints.ratio("size", ratio);
        }

        Ok(PreparedRequest {
            action: ctx.action,
            hints,
            seconds: Some(seconds),
            size,
            remix_of,
            request,
        })
    }

    async fn submit(
        &self,
        channel: &Channel,
        prepared: &PreparedRequest,
        upstream_model: &str,
    ) -> Result<Submission, ProviderError> {
        let base = api_base(channel);
        let (url, body) = match &prepared.remix_of {
            Some(origin) => (
                format!("{}/v1/videos/{}/remix", base, origin),
                json!({ "prompt": prepared.request.prompt }),
            ),
            None => {
                let mut body = json!({
                    "model": upstream_model,
                    "prompt": prepared.request.prompt,
                });
                if let Some(seconds) = prepared.seconds {
                    body["seconds"] = json!(format!("{}", seconds));
                }
                if let Some(size) = &prepared.size {
                    body["size"] = json!(size);
                }
                if let Some(reference) = prepared.request.extra.get("input_reference") {
                    body["input_reference"] = reference.clone();
                }
                (format!("{}/v1/videos", base), body)
            }
        };

        let raw = send(self.client.post(&url).bearer_auth(api_key(channel)).json(&body)).await?;
        if !(200..300).contains(&raw.status) {
            return Err(ProviderError::from_status(raw.status, &raw.body));
        }
        let parsed: VideoResponse = serde_json::from_str(&raw.body).map_err(|e| {
            ProviderError::parse_error(format!("Failed to parse response: {}, body: {}", e, raw.body))
        })?;
        if parsed.id.is_empty() {
            return Err(ProviderError::parse_error(format!(
                "video id is empty, body: {}",
                raw.body
            )));
        }
        Ok(Submission {
            task_id: parsed.id,
            body: raw.body,
        })
    }

    async fn poll(&self, channel: &Channel, task_id: &str) -> Result<RawPoll, ProviderError> {
        let url = format!("{}/v1/videos/{}", api_base(channel), task_id);
        let raw = send(self.client.get(&url).bearer_auth(api_key(channel))).await?;
        match raw.status {
            404 => Ok(RawPoll {
                status: 200,
                body: r#"{"status":"expired"}"#.to_string(),
            }),
            200..=299 | 400 => Ok(raw),
            status => Err(ProviderError::from_status(status, &raw.body)),
        }
    }

    fn normalize(&self, raw: &RawPoll) -> Result<PollResult, ProviderError> {
        let parsed: VideoResponse = serde_json::from_str(&raw.body)
            .map_err(|e| ProviderError::parse_error(format!("unmarshal task result failed: {}", e)))?;

        let mut result = PollResult {
            model: parsed.model,
            progress: parsed
                .progress
                .map(|p| format!("{}%", p.clamp(0.0, 100.0) as u8)),
            ..Default::default()
        };
        let error_message = parsed.error.map(|e| e.message).filter(|m| !m.is_empty());

        match parsed.status.as_str() {
            "queued" => result.status = Some(TaskStatus::Queued),
            "in_progress" => result.status = Some(TaskStatus::InProgress),
            "completed" => {
                result.status = Some(TaskStatus::Success);
                result.progress = Some("100%".into());
                result.result_url = parsed
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("url"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                result.duration = parsed.seconds.as_ref().and_then(|s| match s {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.parse().ok(),
                    _ => None,
                });
            }
            "failed" => {
                result.status = Some(TaskStatus::Failure);
                result.reason = Some(error_message.unwrap_or_else(|| "task failed".to_string()));
            }
            "expired" => {
                result.status = Some(TaskStatus::Failure);
                result.reason = Some("request expired".to_string());
            }
            "" if error_message.is_some() => {
                result.status = Some(TaskStatus::Failure);
                result.reason = error_message;
            }
            _ => {}
        }
        Ok(result)
    }

    fn render_video(&self, task: &Task) -> OpenAiVideo {
        let mut video = OpenAiVideo::from_task(task);
        if task.action == TaskAction::Remix {
            video.remixed_from_video_id = task
                .data_json()
                .get("remixed_from_video_id")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        video
    }
}
