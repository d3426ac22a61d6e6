//! Reconciliation of one task against its provider.
//!
//! Shared by the background sweeper and the fetch routes. Both may race on
//! the same task; the conditional commit in [`TaskStore::commit`] decides
//! which one applies the billing effect.

use std::sync::Arc;
use std::time::Duration;

use crate::account::{Channel, ChannelStore};
use crate::billing::ledger;
use crate::billing::SharedPricingStore;
use crate::provider::AdaptorRegistry;
use crate::storage::now_unix;
use crate::task::state::{CHANNEL_UNAVAILABLE_REASON, TIMEOUT_REASON};
use crate::task::{
    apply_poll, expire, redact_payload, CommitOutcome, PollResult, StoreError, Task, TaskStore,
    Transition,
};

/// Attempts at committing one poll result before giving up until the next sweep.
pub const MAX_COMMIT_ATTEMPTS: usize = 3;

/// What a reconciliation learned about the task.
enum Observation {
    Poll { poll: PollResult, body: String },
    Expire(&'static str),
}

#[derive(Clone)]
pub struct Reconciler {
    tasks: TaskStore,
    channels: ChannelStore,
    registry: Arc<AdaptorRegistry>,
    pricing: SharedPricingStore,
    task_timeout: Option<Duration>,
}

impl Reconciler {
    pub fn new(
        tasks: TaskStore,
        channels: ChannelStore,
        registry: Arc<AdaptorRegistry>,
        pricing: SharedPricingStore,
        task_timeout: Option<Duration>,
    ) -> Self {
        Self {
            tasks,
            channels,
            registry,
            pricing,
            task_timeout,
        }
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn channels(&self) -> &ChannelStore {
        &self.channels
    }

    /// Bring a task up to date, loading its channel first.
    pub async fn refresh(&self, task: Task) -> Result<Task, StoreError> {
        if task.status.is_terminal() {
            return Ok(task);
        }
        let channel = self.channels.get(task.channel_id)?;
        self.reconcile_task(task, channel.as_ref()).await
    }

    /// Reconcile `task` using an already resolved `channel`.
    ///
    /// Transient failures (poll errors, lost races) leave the task as it
    /// was; the returned record is always the latest known state.
    pub async fn reconcile_task(
        &self,
        task: Task,
        channel: Option<&Channel>,
    ) -> Result<Task, StoreError> {
        if task.status.is_terminal() {
            return Ok(task);
        }

        let observation = match self.observe(&task, channel).await {
            Some(observation) => observation,
            None => return Ok(task),
        };

        self.commit_with_retry(task, &observation).await
    }

    async fn observe(&self, task: &Task, channel: Option<&Channel>) -> Option<Observation> {
        if self.is_timed_out(task) {
            return Some(Observation::Expire(TIMEOUT_REASON));
        }

        let channel = match channel {
            Some(channel) if channel.is_enabled() => channel,
            _ => return Some(Observation::Expire(CHANNEL_UNAVAILABLE_REASON)),
        };

        let Some(adaptor) = self.registry.get(task.platform) else {
            tracing::warn!("No adaptor registered for platform {}", task.platform);
            return None;
        };

        let raw = match adaptor.poll(channel, &task.task_id).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    "Polling task {} on channel {} failed, retrying later: {}",
                    task.task_id,
                    channel.id,
                    e
                );
                return None;
            }
        };

        let poll = adaptor.normalize(&raw).unwrap_or_else(|e| {
            tracing::warn!("Unreadable poll response for task {}: {}", task.task_id, e);
            PollResult::unknown()
        });
        Some(Observation::Poll {
            poll,
            body: raw.body,
        })
    }

    fn is_timed_out(&self, task: &Task) -> bool {
        let Some(timeout) = self.task_timeout else {
            return false;
        };
        task.submit_time > 0 && task.submit_time + timeout.as_secs() as i64 <= now_unix()
    }

    async fn transition(&self, prev: &Task, observation: &Observation) -> Transition {
        let now = now_unix();
        match observation {
            Observation::Expire(reason) => expire(prev, reason, now),
            Observation::Poll { poll, body } => {
                let pricing = self.pricing.snapshot().await;
                let mut transition = apply_poll(prev, poll, &pricing, now);
                if !prev.status.is_terminal() && !body.is_empty() {
                    transition.next.data = redact_payload(body);
                }
                transition
            }
        }
    }

    async fn commit_with_retry(
        &self,
        mut current: Task,
        observation: &Observation,
    ) -> Result<Task, StoreError> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let transition = self.transition(&current, observation).await;
            if transition.is_noop(&current) {
                return Ok(current);
            }

            match self
                .tasks
                .commit(current.status, &transition.next, &transition.effect)?
            {
                CommitOutcome::Applied { user_delta } => {
                    ledger::mirror_token_best_effort(
                        self.tasks.database(),
                        current.private_data.token_id,
                        user_delta,
                    );
                    log_transition(&current, &transition.next, user_delta);
                    return Ok(transition.next);
                }
                CommitOutcome::Conflict => {
                    tracing::debug!(
                        "Task {} changed concurrently (attempt {}), re-reading",
                        current.task_id,
                        attempt
                    );
                    match self.tasks.get(current.id)? {
                        Some(latest) if latest.status.is_terminal() => return Ok(latest),
                        Some(latest) => current = latest,
                        None => return Ok(current),
                    }
                }
            }
        }

        tracing::warn!(
            "Task {} kept changing under reconciliation, deferring to next sweep",
            current.task_id
        );
        Ok(current)
    }
}

fn log_transition(prev: &Task, next: &Task, user_delta: i64) {
    if prev.status == next.status {
        return;
    }
    if next.status.is_terminal() {
        tracing::info!(
            "Task {} {} -> {} (quota {} -> {}, balance change {})",
            next.task_id,
            prev.status,
            next.status,
            prev.quota,
            next.quota,
            user_delta
        );
        if next.fail_reason == TIMEOUT_REASON {
            tracing::warn!("Task {} timed out and was refunded {}", next.task_id, user_delta);
        }
    } else {
        tracing::debug!("Task {} {} -> {}", next.task_id, prev.status, next.status);
    }
}
