//! OpenAI-style video object returned by `/v1/videos` routes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl From<TaskStatus> for VideoStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Unknown | TaskStatus::Submitted | TaskStatus::Queued => Self::Queued,
            TaskStatus::InProgress => Self::InProgress,
            TaskStatus::Success => Self::Completed,
            TaskStatus::Failure => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoError {
    pub message: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiVideo {
    pub id: String,
    pub object: String,
    pub model: String,
    pub status: VideoStatus,
    pub progress: u8,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remixed_from_video_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<VideoError>,
    #[serde(skip_serializing_if = "Map::is_empty", default)]
    pub metadata: Map<String, Value>,
}

impl OpenAiVideo {
    pub fn queued(id: impl Into<String>, model: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            object: "video".to_string(),
            model: model.into(),
            status: VideoStatus::Queued,
            progress: 0,
            created_at,
            completed_at: None,
            seconds: None,
            size: None,
            remixed_from_video_id: None,
            error: None,
            metadata: Map::new(),
        }
    }

    /// Render a stored task. Adaptors can enrich the result from `task.data`.
    pub fn from_task(task: &Task) -> Self {
        let mut video = Self::queued(&task.task_id, task.model_name(), task.created_at);
        video.status = task.status.into();
        video.progress = parse_progress(&task.progress);
        video.seconds = task.properties.seconds.map(|s| format!("{}", s));
        video.size = task.properties.size.clone();
        if task.finish_time > 0 {
            video.completed_at = Some(task.finish_time);
        }
        match task.status {
            TaskStatus::Success => {
                if let Some(url) = task.result_url() {
                    video.metadata.insert("url".into(), Value::String(url.to_string()));
                }
            }
            TaskStatus::Failure if !task.fail_reason.is_empty() => {
                video.error = Some(VideoError {
                    message: task.fail_reason.clone(),
                    code: "generation_failed".to_string(),
                });
            }
            _ => {}
        }
        video
    }
}

/// `"30%"` -> 30. Unparseable values give 0.
pub fn parse_progress(progress: &str) -> u8 {
    progress
        .trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .map(|p| p.clamp(0.0, 100.0) as u8)
        .unwrap_or(0)
}
