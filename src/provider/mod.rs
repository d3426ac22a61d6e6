//! Provider adaptors for asynchronous media jobs.
//!
//! This module provides a trait-based abstraction over upstream vendors.
//! Each vendor translates the gateway's request into its wire format,
//! submits it, polls it and normalizes the vendor status into a
//! [`PollResult`]. The submission and reconciliation flows only depend on
//! [`TaskAdaptor`]; adding a vendor means registering one more adaptor.

mod error;
mod sora;
mod video;
mod volc;
mod xai;

pub use error::{classify_http_status, ProviderError, ProviderErrorKind};
pub use sora::SoraAdaptor;
pub use video::{parse_progress, OpenAiVideo, VideoError, VideoStatus};
pub use volc::VolcAdaptor;
pub use xai::XaiAdaptor;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::account::Channel;
use crate::billing::BillingHints;
use crate::error::GatewayError;
use crate::task::{PollResult, Task, TaskAction};

/// Upstream vendor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Xai,
    Volc,
    Sora,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown platform: {0}")]
pub struct UnknownPlatform(pub String);

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xai => "xai",
            Self::Volc => "volc",
            Self::Sora => "sora",
        }
    }
}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xai" | "grok" => Ok(Self::Xai),
            "volc" | "volcengine" | "doubao" => Ok(Self::Volc),
            "sora" | "openai" => Ok(Self::Sora),
            other => Err(UnknownPlatform(other.to_string())),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client request body shared by all video routes.
///
/// Vendor-specific fields not named here are kept in `extra` and forwarded
/// by adaptors that accept them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VideoRequest {
    /// Requested length from `duration`, falling back to `seconds`.
    /// Numbers and numeric strings are accepted; non-positive values are ignored.
    pub fn requested_seconds(&self) -> Option<f64> {
        [&self.duration, &self.seconds]
            .into_iter()
            .flatten()
            .filter_map(number_like)
            .find(|s| *s > 0.0)
    }

    pub fn has_image(&self) -> bool {
        self.image.as_ref().is_some_and(media_present) || !self.images.is_empty()
    }

    pub fn has_video(&self) -> bool {
        self.video.as_ref().is_some_and(media_present)
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model.as_deref().map(str::trim).filter(|m| !m.is_empty())
    }
}

fn number_like(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn media_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Object(m) => !m.is_empty(),
        Value::Array(a) => !a.is_empty(),
        _ => true,
    }
}

/// URL of a media reference given as a string or as `{"url": ...}`.
pub(crate) fn media_url(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(m) => m
            .get("url")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

/// What a submission is about, as known before the adaptor sees it.
#[derive(Debug, Clone, Copy)]
pub struct SubmitContext<'a> {
    pub action: TaskAction,
    /// Origin task of a remix.
    pub origin: Option<&'a Task>,
}

/// Output of `validate_and_prepare`.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    /// Possibly rewritten (a request carrying a source video becomes an edit).
    pub action: TaskAction,
    pub hints: BillingHints,
    /// Billable seconds the price was computed with.
    pub seconds: Option<f64>,
    pub size: Option<String>,
    /// Provider id of the origin video for remixes.
    pub remix_of: Option<String>,
    pub request: VideoRequest,
}

/// Accepted upstream submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub task_id: String,
    /// Raw response body.
    pub body: String,
}

/// Raw poll response. 404 is already rewritten by adaptors that treat it
/// as expiry.
#[derive(Debug, Clone)]
pub struct RawPoll {
    pub status: u16,
    pub body: String,
}

/// Capability set every vendor implements.
#[async_trait]
pub trait TaskAdaptor: Send + Sync {
    fn platform(&self) -> Platform;

    /// Models served by this vendor.
    fn models(&self) -> &'static [&'static str];

    /// Validate the request and derive billing hints. Never touches the network.
    fn validate_and_prepare(
        &self,
        request: VideoRequest,
        ctx: &SubmitContext<'_>,
    ) -> Result<PreparedRequest, GatewayError>;

    async fn submit(
        &self,
        channel: &Channel,
        prepared: &PreparedRequest,
        upstream_model: &str,
    ) -> Result<Submission, ProviderError>;

    async fn poll(&self, channel: &Channel, task_id: &str) -> Result<RawPoll, ProviderError>;

    /// Translate a raw poll. Missing optional fields never fail; only a
    /// structurally invalid body does.
    fn normalize(&self, raw: &RawPoll) -> Result<PollResult, ProviderError>;

    fn render_video(&self, task: &Task) -> OpenAiVideo {
        OpenAiVideo::from_task(task)
    }
}

/// Adaptors keyed by platform.
#[derive(Clone, Default)]
pub struct AdaptorRegistry {
    adaptors: HashMap<Platform, Arc<dyn TaskAdaptor>>,
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every shipped vendor, sharing one HTTP client bounded
    /// by `timeout`.
    pub fn with_defaults(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let mut registry = Self::new();
        registry.register(Arc::new(XaiAdaptor::new(client.clone())));
        registry.register(Arc::new(VolcAdaptor::new(client.clone())));
        registry.register(Arc::new(SoraAdaptor::new(client)));
        Ok(registry)
    }

    pub fn register(&mut self, adaptor: Arc<dyn TaskAdaptor>) {
        self.adaptors.insert(adaptor.platform(), adaptor);
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn TaskAdaptor>> {
        self.adaptors.get(&platform).cloned()
    }

    /// Platform whose adaptor lists `model`.
    pub fn platform_for_model(&self, model: &str) -> Option<Platform> {
        self.adaptors
            .values()
            .find(|a| a.models().contains(&model))
            .map(|a| a.platform())
    }
}

/// Channel base URL without a trailing slash or `/v1`.
pub(crate) fn api_base(channel: &Channel) -> &str {
    let base = channel.base_url.trim_end_matches('/');
    base.strip_suffix("/v1").unwrap_or(base)
}

/// First key of a possibly multi-line key list.
pub(crate) fn api_key(channel: &Channel) -> &str {
    channel.api_key.lines().next().unwrap_or_default().trim()
}

/// Send a request and return status and body. Transport errors are mapped;
/// HTTP statuses are left to the caller.
pub(crate) async fn send(request: reqwest::RequestBuilder) -> Result<RawPoll, ProviderError> {
    let response = request.send().await.map_err(ProviderError::from_reqwest)?;
    let status = response.status().as_u16();
    let body = response.text().await.map_err(ProviderError::from_reqwest)?;
    tracing::debug!("Upstream responded {}: {}", status, body);
    Ok(RawPoll { status, body })
}
