//! Relay engine: submission, reconciliation and the background sweeper.
//!
//! - `submit`: validate, price, reserve and submit a new task
//! - `reconcile`: poll one task and commit its transition with billing
//! - `sweeper`: periodic reconciliation of every unfinished task

pub mod reconcile;
pub mod submit;
pub mod sweeper;

pub use reconcile::Reconciler;
pub use submit::{Caller, SubmitRequest, Submitter};
pub use sweeper::{SweepReport, Sweeper};

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::account::{
        AccountStore, Channel, ChannelStore, NewChannel, NewToken, NewUser,
    };
    use crate::billing::BillingHints;
    use crate::error::GatewayError;
    use crate::provider::{
        Platform, PreparedRequest, ProviderError, RawPoll, SubmitContext, Submission, TaskAdaptor,
        VideoRequest,
    };
    use crate::storage::{now_unix, Database};
    use crate::task::store::tests::{consume_entry, new_task};
    use crate::task::{PollResult, Task, TaskAction, TaskStatus, TaskStore};

    use super::Caller;

    /// Adaptor answering every poll with one scripted body.
    pub(crate) struct ScriptedAdaptor {
        poll_body: Mutex<Value>,
        polls: AtomicUsize,
        submits: AtomicUsize,
        fail_polls: AtomicBool,
        fail_submits: AtomicBool,
    }

    impl ScriptedAdaptor {
        pub(crate) fn new(poll_body: Value) -> Self {
            Self {
                poll_body: Mutex::new(poll_body),
                polls: AtomicUsize::new(0),
                submits: AtomicUsize::new(0),
                fail_polls: AtomicBool::new(false),
                fail_submits: AtomicBool::new(false),
            }
        }

        pub(crate) fn polls(&self) -> usize {
            self.polls.load(Ordering::SeqCst)
        }

        pub(crate) fn submits(&self) -> usize {
            self.submits.load(Ordering::SeqCst)
        }

        pub(crate) fn fail_polls(&self, fail: bool) {
            self.fail_polls.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn fail_submits(&self, fail: bool) {
            self.fail_submits.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn script(&self, body: Value) {
            *self.poll_body.lock().unwrap() = body;
        }
    }

    #[async_trait]
    impl TaskAdaptor for ScriptedAdaptor {
        fn platform(&self) -> Platform {
            Platform::Xai
        }

        fn models(&self) -> &'static [&'static str] {
            &["grok-imagine-video"]
        }

        fn validate_and_prepare(
            &self,
            request: VideoRequest,
            ctx: &SubmitContext<'_>,
        ) -> Result<PreparedRequest, GatewayError> {
            if request.prompt.is_empty() {
                return Err(GatewayError::validation("invalid_request", "prompt is required"));
            }
            let action = if request.has_video() {
                TaskAction::Edit
            } else {
                ctx.action
            };
            let seconds = request.requested_seconds().unwrap_or(5.0);
            Ok(PreparedRequest {
                action,
                hints: BillingHints::default().ratio("seconds", seconds),
                seconds: Some(seconds),
                size: None,
                remix_of: ctx.origin.map(|o| o.task_id.clone()),
                request,
            })
        }

        async fn submit(
            &self,
            _channel: &Channel,
            _prepared: &PreparedRequest,
            upstream_model: &str,
        ) -> Result<Submission, ProviderError> {
            if self.fail_submits.load(Ordering::SeqCst) {
                return Err(ProviderError::from_status(502, "bad gateway"));
            }
            let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Submission {
                task_id: format!("job-{}", n),
                body: json!({"request_id": format!("job-{}", n), "model": upstream_model})
                    .to_string(),
            })
        }

        async fn poll(&self, _channel: &Channel, _task_id: &str) -> Result<RawPoll, ProviderError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail_polls.load(Ordering::SeqCst) {
                return Err(ProviderError::timeout("poll timed out"));
            }
            let body = self.poll_body.lock().unwrap().to_string();
            Ok(RawPoll { status: 200, body })
        }

        fn normalize(&self, raw: &RawPoll) -> Result<PollResult, ProviderError> {
            let body: Value = serde_json::from_str(&raw.body)
                .map_err(|e| ProviderError::parse_error(e.to_string()))?;
            let status = match body["status"].as_str().unwrap_or_default() {
                "queued" => Some(TaskStatus::Queued),
                "running" => Some(TaskStatus::InProgress),
                "done" => Some(TaskStatus::Success),
                "failed" => Some(TaskStatus::Failure),
                _ => None,
            };
            Ok(PollResult {
                status,
                progress: body["progress"].as_str().map(str::to_string),
                result_url: body["url"].as_str().map(str::to_string),
                reason: body["reason"].as_str().map(str::to_string),
                total_tokens: body["total_tokens"].as_i64(),
                duration: body["duration"].as_f64(),
                model: None,
            })
        }
    }

    /// Insert a reserved task the way a submission would.
    pub(crate) fn seed_task(
        db: &Database,
        user_id: i64,
        channel_id: i64,
        task_id: &str,
        quota: i64,
        action: TaskAction,
    ) -> Task {
        let mut task = new_task(user_id, channel_id, task_id, quota);
        task.action = action;
        task.submit_time = now_unix() - 3600;
        TaskStore::new(db.clone())
            .create_reserved(task.clone(), &consume_entry(&task))
            .unwrap()
    }

    pub(crate) fn channel_for(db: &Database, channel_id: i64) -> Channel {
        ChannelStore::new(db.clone()).get(channel_id).unwrap().unwrap()
    }

    pub(crate) fn seed_caller(db: &Database, quota: i64) -> Caller {
        let accounts = AccountStore::new(db.clone());
        let user = accounts
            .create_user(&NewUser {
                username: format!("user-{}", uuid::Uuid::new_v4().simple()),
                group: "default".into(),
                quota,
            })
            .unwrap();
        let token = accounts
            .create_token(&NewToken {
                user_id: user.id,
                name: "default".into(),
                remain_quota: quota,
                unlimited_quota: false,
                group: None,
            })
            .unwrap();
        Caller { user, token }
    }

    pub(crate) fn seed_channel(db: &Database, mapping: Option<Value>) -> Channel {
        ChannelStore::new(db.clone())
            .create(&NewChannel {
                name: "xai".into(),
                platform: Platform::Xai,
                base_url: "https://api.x.ai".into(),
                api_key: "key".into(),
                models: Vec::new(),
                model_mapping: mapping,
            })
            .unwrap()
    }
}
