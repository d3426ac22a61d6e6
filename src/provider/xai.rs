//! xAI video (`grok-imagine-video`): generations and edits.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    api_base, api_key, send, OpenAiVideo, Platform, PreparedRequest, ProviderError, RawPoll,
    SubmitContext, Submission, TaskAdaptor, VideoRequest,
};
use crate::account::Channel;
use crate::billing::{BillingHints, Surcharge, SurchargeKind};
use crate::error::GatewayError;
use crate::task::state::EDIT_DURATION_CAP_SECS;
use crate::task::{PollResult, Task, TaskAction, TaskStatus};

const MODELS: &[&str] = &["grok-imagine-video"];

const DEFAULT_SECONDS: f64 = 5.0;
/// 720p costs $0.07/s against $0.05/s for the default tier.
const RESOLUTION_720P_RATIO: f64 = 1.4;
const INPUT_IMAGE_PRICE: f64 = 0.002;
const INPUT_VIDEO_PRICE_PER_SEC: f64 = 0.01;

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    video: Option<VideoData>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoData {
    #[serde(default)]
    url: String,
    #[serde(default)]
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<Value>,
}

pub struct XaiAdaptor {
    client: Client,
}

impl XaiAdaptor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TaskAdaptor for XaiAdaptor {
    fn platform(&self) -> Platform {
        Platform::Xai
    }

    fn models(&self) -> &'static [&'static str] {
        MODELS
    }

    fn validate_and_prepare(
        &self,
        request: VideoRequest,
        ctx: &SubmitContext<'_>,
    ) -> Result<PreparedRequest, GatewayError> {
        if request.prompt.trim().is_empty() && !request.has_video() {
            return Err(GatewayError::validation("invalid_request", "prompt is required"));
        }
        if ctx.action == TaskAction::Remix {
            return Err(GatewayError::validation(
                "invalid_request",
                "remix is not supported for this platform",
            ));
        }

        let is_edit = request.has_video() || ctx.action == TaskAction::Edit;
        if is_edit && !request.has_video() {
            return Err(GatewayError::validation("invalid_request", "video is required for edits"));
        }

        // Edits produce the input duration, capped; they are always billed at the cap.
        let seconds = if is_edit {
            EDIT_DURATION_CAP_SECS
        } else {
            request.requested_seconds().unwrap_or(DEFAULT_SECONDS).round()
        };

        let mut hints = BillingHints::default().ratio("seconds", seconds);
        if request.resolution.as_deref() == Some("720p") {
            hints = hints.ratio("resolution(720p)", RESOLUTION_720P_RATIO);
        }
        if request.has_image() {
            hints = hints.surcharge(Surcharge {
                kind: SurchargeKind::InputImage,
                unit_price: INPUT_IMAGE_PRICE,
                units: 1.0,
            });
        }
        if is_edit {
            hints = hints.surcharge(Surcharge {
                kind: SurchargeKind::InputVideo,
                unit_price: INPUT_VIDEO_PRICE_PER_SEC,
                units: seconds,
            });
        }

        Ok(PreparedRequest {
            action: if is_edit { TaskAction::Edit } else { TaskAction::Generate },
            hints,
            seconds: Some(seconds),
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
        let path = match prepared.action {
            TaskAction::Edit => "videos/edits",
            _ => "videos/generations",
        };
        let url = format!("{}/v1/{}", api_base(channel), path);

        let mut body = serde_json::to_value(&prepared.request)
            .map_err(|e| ProviderError::parse_error(e.to_string()))?;
        if let Some(obj) = body.as_object_mut() {
            obj.remove("platform");
            obj.insert("model".into(), json!(upstream_model));
        }

        let raw = send(self.client.post(&url).bearer_auth(api_key(channel)).json(&body)).await?;
        if !(200..300).contains(&raw.status) {
            return Err(ProviderError::from_status(raw.status, &raw.body));
        }

        let parsed: SubmitResponse = serde_json::from_str(&raw.body).map_err(|e| {
            ProviderError::parse_error(format!("Failed to parse response: {}, body: {}", e, raw.body))
        })?;
        if parsed.request_id.is_empty() {
            return Err(ProviderError::parse_error(format!(
                "request_id is empty, body: {}",
                raw.body
            )));
        }
        Ok(Submission {
            task_id: parsed.request_id,
            body: raw.body,
        })
    }

    async fn poll(&self, channel: &Channel, task_id: &str) -> Result<RawPoll, ProviderError> {
        let url = format!("{}/v1/videos/{}", api_base(channel), task_id);
        let raw = send(self.client.get(&url).bearer_auth(api_key(channel))).await?;
        match raw.status {
            // Expired or unknown to xAI.
            404 => Ok(RawPoll {
                status: 200,
                body: r#"{"status":"expired"}"#.to_string(),
            }),
            400 | 200..=299 => Ok(raw),
            status => Err(ProviderError::from_status(status, &raw.body)),
        }
    }

    fn normalize(&self, raw: &RawPoll) -> Result<PollResult, ProviderError> {
        if let Ok(ErrorResponse { error: Some(error) }) = serde_json::from_str(&raw.body) {
            let reason = match error {
                Value::String(s) => s,
                Value::Object(m) => m
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("upstream error")
                    .to_string(),
                other => other.to_string(),
            };
            if !reason.is_empty() {
                return Ok(PollResult {
                    status: Some(TaskStatus::Failure),
                    reason: Some(reason),
                    ..Default::default()
                });
            }
        }

        let parsed: PollResponse = serde_json::from_str(&raw.body)
            .map_err(|e| ProviderError::parse_error(format!("unmarshal task result failed: {}", e)))?;

        let mut result = PollResult {
            model: parsed.model,
            ..Default::default()
        };
        let video = parsed.video.filter(|v| !v.url.is_empty());
        match (parsed.status.as_str(), video) {
            ("expired", _) => {
                result.status = Some(TaskStatus::Failure);
                result.reason = Some("request expired".to_string());
            }
            (_, Some(video)) => {
                result.status = Some(TaskStatus::Success);
                result.result_url = Some(video.url);
                result.duration = (video.duration > 0.0).then_some(video.duration);
            }
            ("done", None) => result.status = Some(TaskStatus::Success),
            ("pending", None) => result.status = Some(TaskStatus::Queued),
            ("", None) => {}
            (_, None) => result.status = Some(TaskStatus::Queued),
        }
        Ok(result)
    }

    fn render_video(&self, task: &Task) -> OpenAiVideo {
        let mut video = OpenAiVideo::from_task(task);
        if task.status == TaskStatus::Success {
            if let Some(duration) = task
                .data_json()
                .pointer("/video/duration")
                .and_then(Value::as_f64)
                .filter(|d| *d > 0.0)
            {
                video.metadata.insert("duration".into(), json!(duration));
            }
        }
        video
    }
}
