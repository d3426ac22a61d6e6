//! Video relay endpoints.
//!
//! `/v1/video/*` routes speak the generic task envelope
//! (`{"code": "success", "message": "", "data": ...}`); `/v1/videos*` routes
//! return OpenAI-style video objects rendered by the task's adaptor.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::Uri,
    Json,
};
use serde::{Deserialize, Serialize};

use super::routes::AppState;
use crate::error::{GatewayError, GatewayResult};
use crate::provider::{OpenAiVideo, VideoRequest};
use crate::relay::{Caller, SubmitRequest};
use crate::task::{Task, TaskAction, TaskDto};

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct TaskEnvelope<T> {
    pub code: &'static str,
    pub message: String,
    pub data: T,
}

impl<T> TaskEnvelope<T> {
    fn success(data: T) -> Json<Self> {
        Json(Self {
            code: "success",
            message: String::new(),
            data,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchFetchRequest {
    #[serde(default)]
    pub ids: Vec<String>,
}

/// Upper bound on ids per batch fetch.
const MAX_BATCH_IDS: usize = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Submission
// ─────────────────────────────────────────────────────────────────────────────

async fn submit(
    state: &AppState,
    caller: &Caller,
    uri: &Uri,
    action: TaskAction,
    origin_task_id: Option<String>,
    body: VideoRequest,
) -> GatewayResult<Task> {
    state
        .submitter
        .submit(
            caller,
            SubmitRequest {
                action,
                request_path: uri.path().to_string(),
                origin_task_id,
                body,
            },
        )
        .await
}

/// POST /v1/video/generations - generic submission.
pub async fn submit_generation(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    uri: Uri,
    Json(body): Json<VideoRequest>,
) -> GatewayResult<Json<TaskEnvelope<TaskDto>>> {
    let task = submit(&state, &caller, &uri, TaskAction::Generate, None, body).await?;
    Ok(TaskEnvelope::success(task.to_dto()))
}

/// POST /v1/videos - OpenAI-shaped submission.
pub async fn submit_video(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    uri: Uri,
    Json(body): Json<VideoRequest>,
) -> GatewayResult<Json<OpenAiVideo>> {
    let task = submit(&state, &caller, &uri, TaskAction::Generate, None, body).await?;
    Ok(Json(render(&state, &task)))
}

/// POST /v1/videos/edits
pub async fn submit_edit(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    uri: Uri,
    Json(body): Json<VideoRequest>,
) -> GatewayResult<Json<OpenAiVideo>> {
    let task = submit(&state, &caller, &uri, TaskAction::Edit, None, body).await?;
    Ok(Json(render(&state, &task)))
}

/// POST /v1/videos/:video_id/remix
pub async fn submit_remix(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(video_id): Path<String>,
    uri: Uri,
    Json(body): Json<VideoRequest>,
) -> GatewayResult<Json<OpenAiVideo>> {
    let task = submit(
        &state,
        &caller,
        &uri,
        TaskAction::Remix,
        Some(video_id),
        body,
    )
    .await?;
    Ok(Json(render(&state, &task)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Fetch
// ─────────────────────────────────────────────────────────────────────────────

/// Reconcile a non-terminal task before it is shown. Failures keep the
/// stored state; the sweeper retries later.
async fn refreshed(state: &AppState, task: Task) -> Task {
    if task.status.is_terminal() {
        return task;
    }
    match state.reconciler.refresh(task.clone()).await {
        Ok(task) => task,
        Err(e) => {
            tracing::warn!("On-demand reconciliation of task {} failed: {}", task.task_id, e);
            task
        }
    }
}

async fn load(state: &AppState, caller: &Caller, task_id: &str) -> GatewayResult<Task> {
    let task = state
        .tasks
        .get_by_task_id(caller.user.id, task_id)?
        .ok_or(GatewayError::TaskNotFound)?;
    Ok(refreshed(state, task).await)
}

fn render(state: &AppState, task: &Task) -> OpenAiVideo {
    match state.registry.get(task.platform) {
        Some(adaptor) => adaptor.render_video(task),
        None => OpenAiVideo::from_task(task),
    }
}

/// GET /v1/video/generations/:task_id
pub async fn fetch_generation(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(task_id): Path<String>,
) -> GatewayResult<Json<TaskEnvelope<TaskDto>>> {
    let task = load(&state, &caller, &task_id).await?;
    Ok(TaskEnvelope::success(task.to_dto()))
}

/// GET /v1/videos/:video_id
pub async fn fetch_video(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(video_id): Path<String>,
) -> GatewayResult<Json<OpenAiVideo>> {
    let task = load(&state, &caller, &video_id).await?;
    Ok(Json(render(&state, &task)))
}

/// POST /v1/video/fetch - several tasks at once. Unknown ids are skipped.
pub async fn fetch_batch(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<BatchFetchRequest>,
) -> GatewayResult<Json<TaskEnvelope<Vec<TaskDto>>>> {
    if req.ids.is_empty() {
        return Err(GatewayError::validation("invalid_request", "ids is required"));
    }
    if req.ids.len() > MAX_BATCH_IDS {
        return Err(GatewayError::validation(
            "invalid_request",
            format!("at most {} ids per request", MAX_BATCH_IDS),
        ));
    }

    let tasks = state.tasks.get_many(caller.user.id, &req.ids)?;
    let tasks = futures::future::join_all(tasks.into_iter().map(|t| refreshed(&state, t))).await;
    Ok(TaskEnvelope::success(
        tasks.iter().map(Task::to_dto).collect(),
    ))
}
