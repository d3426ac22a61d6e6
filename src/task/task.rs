//! Task record and its lifecycle enums.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::Platform;

/// Lifecycle status of an asynchronous job.
///
/// Statuses only move forward by `rank`; `Success` and `Failure` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Provider returned nothing usable. Never persisted as a transition.
    Unknown,
    Submitted,
    Queued,
    InProgress,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Submitted => "SUBMITTED",
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "SUBMITTED" => Self::Submitted,
            "QUEUED" => Self::Queued,
            "IN_PROGRESS" => Self::InProgress,
            "SUCCESS" => Self::Success,
            "FAILURE" => Self::Failure,
            _ => Self::Unknown,
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Submitted => 1,
            Self::Queued => 2,
            Self::InProgress => 3,
            Self::Success | Self::Failure => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Progress shown when the provider gives no hint.
    pub fn default_progress(&self) -> &'static str {
        match self {
            Self::Unknown => "0%",
            Self::Submitted => "10%",
            Self::Queued => "20%",
            Self::InProgress => "30%",
            Self::Success | Self::Failure => "100%",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Generate,
    Edit,
    Remix,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Edit => "edit",
            Self::Remix => "remix",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "edit" => Self::Edit,
            "remix" => Self::Remix,
            _ => Self::Generate,
        }
    }
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission-time metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProperties {
    #[serde(default)]
    pub origin_model_name: String,
    #[serde(default)]
    pub upstream_model_name: String,
    #[serde(default)]
    pub is_model_mapped: bool,
    #[serde(default)]
    pub request_path: String,
    /// Billable seconds the reservation was priced with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Reservation used the last-resort fallback price.
    #[serde(default)]
    pub default_price: bool,
}

/// Identity the task was billed to. Never exposed to clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPrivateData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<i64>,
    #[serde(default)]
    pub token_name: String,
    #[serde(default)]
    pub user_group: String,
}

/// One asynchronous job.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: i64,
    /// Provider-assigned id, unique per platform.
    pub task_id: String,
    pub platform: Platform,
    pub user_id: i64,
    pub channel_id: i64,
    pub action: TaskAction,
    pub status: TaskStatus,
    pub progress: String,
    pub submit_time: i64,
    pub start_time: i64,
    pub finish_time: i64,
    /// Amount currently charged and not refunded.
    pub quota: i64,
    pub group: String,
    /// Last provider payload, redacted.
    pub data: String,
    /// Failure message, or result URL on success.
    pub fail_reason: String,
    pub properties: TaskProperties,
    pub private_data: TaskPrivateData,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn model_name(&self) -> &str {
        &self.properties.origin_model_name
    }

    pub fn data_json(&self) -> Value {
        serde_json::from_str(&self.data).unwrap_or(Value::Null)
    }

    /// Result URL once the task succeeded.
    pub fn result_url(&self) -> Option<&str> {
        (self.status == TaskStatus::Success && !self.fail_reason.is_empty())
            .then_some(self.fail_reason.as_str())
    }

    pub fn to_dto(&self) -> TaskDto {
        TaskDto {
            task_id: self.task_id.clone(),
            platform: self.platform.as_str().to_string(),
            action: self.action.as_str().to_string(),
            status: self.status,
            fail_reason: self.fail_reason.clone(),
            submit_time: self.submit_time,
            start_time: self.start_time,
            finish_time: self.finish_time,
            progress: self.progress.clone(),
            data: self.data_json(),
        }
    }
}

/// Generic task envelope returned by `/v1/video/generations`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDto {
    pub task_id: String,
    pub platform: String,
    pub action: String,
    pub status: TaskStatus,
    pub fail_reason: String,
    pub submit_time: i64,
    pub start_time: i64,
    pub finish_time: i64,
    pub progress: String,
    pub data: Value,
}
