//! Task state machine.
//!
//! Pure functions: given the persisted task and a normalized poll result,
//! compute the next task record and the ledger effect that must be applied
//! together with it. Nothing here touches storage.

use serde_json::{json, Map, Value};

use super::task::{Task, TaskAction, TaskStatus};
use crate::billing::{AuditEntry, LedgerEffect, LogType, PricingTable};

/// Maximum billable output duration of an edit.
pub const EDIT_DURATION_CAP_SECS: f64 = 8.7;

/// Seconds billed when an edit is rejected by content moderation.
/// Policy value: the provider charges nearly in full for rejected edits.
pub const MODERATION_EDIT_BILLED_SECS: f64 = 8.0;

pub const TIMEOUT_REASON: &str = "timed out";
pub const CHANNEL_UNAVAILABLE_REASON: &str = "channel unavailable";

/// Provider status normalized by an adaptor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PollResult {
    pub status: Option<TaskStatus>,
    pub progress: Option<String>,
    /// Result locator on success.
    pub result_url: Option<String>,
    /// Failure reason.
    pub reason: Option<String>,
    /// Usage tokens, for token-metered models.
    pub total_tokens: Option<i64>,
    /// Actual output duration in seconds, for duration-metered actions.
    pub duration: Option<f64>,
    /// Model reported by the provider.
    pub model: Option<String>,
}

impl PollResult {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status.unwrap_or(TaskStatus::Unknown)
    }
}

/// Next persisted state plus its billing consequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: Task,
    pub effect: LedgerEffect,
}

impl Transition {
    fn unchanged(next: Task) -> Self {
        Self {
            next,
            effect: LedgerEffect::None,
        }
    }

    /// Nothing to write.
    pub fn is_noop(&self, prev: &Task) -> bool {
        self.effect.is_none() && self.next == *prev
    }
}

pub fn is_moderation_failure(reason: &str) -> bool {
    reason.to_lowercase().contains("content moderation")
}

/// Apply one poll result to `prev`.
pub fn apply_poll(prev: &Task, poll: &PollResult, pricing: &PricingTable, now: i64) -> Transition {
    let mut next = prev.clone();
    let hint = poll.progress.as_deref().filter(|p| !p.is_empty());

    if prev.status.is_terminal() {
        if let Some(hint) = hint {
            next.progress = hint.to_string();
        }
        return Transition::unchanged(next);
    }

    let status = poll.status();
    let effect = match status {
        TaskStatus::Unknown => LedgerEffect::None,
        TaskStatus::Submitted | TaskStatus::Queued | TaskStatus::InProgress => {
            if status.rank() > prev.status.rank() {
                next.status = status;
                next.progress = status.default_progress().to_string();
            }
            if next.status == TaskStatus::InProgress && next.start_time == 0 {
                next.start_time = now;
            }
            LedgerEffect::None
        }
        TaskStatus::Success => {
            next.status = TaskStatus::Success;
            next.progress = status.default_progress().to_string();
            next.finish_time = now;
            next.fail_reason = poll
                .result_url
                .clone()
                .filter(|url| !url.starts_with("data:"))
                .unwrap_or_default();
            success_effect(prev, &mut next, poll, pricing)
        }
        TaskStatus::Failure => {
            let reason = poll
                .reason
                .clone()
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| "task failed".to_string());
            fail(prev, &mut next, &reason, now)
        }
    };

    if let Some(hint) = hint {
        next.progress = hint.to_string();
    }

    Transition { next, effect }
}

/// Force a non-terminal task into `Failure` without consulting the provider.
/// Used for timeouts and tasks whose channel became unavailable.
pub fn expire(prev: &Task, reason: &str, now: i64) -> Transition {
    if prev.status.is_terminal() {
        return Transition::unchanged(prev.clone());
    }
    let mut next = prev.clone();
    let effect = fail(prev, &mut next, reason, now);
    Transition { next, effect }
}

fn fail(prev: &Task, next: &mut Task, reason: &str, now: i64) -> LedgerEffect {
    next.status = TaskStatus::Failure;
    next.progress = TaskStatus::Failure.default_progress().to_string();
    next.finish_time = now;
    next.fail_reason = reason.to_string();

    if prev.quota == 0 {
        return LedgerEffect::None;
    }

    if is_moderation_failure(reason) {
        if prev.action == TaskAction::Edit {
            let actual = prorate(prev.quota, MODERATION_EDIT_BILLED_SECS);
            next.quota = actual;
            let mut other = base_other(prev);
            other.insert("moderation".into(), json!(true));
            other.insert("billed_seconds".into(), json!(MODERATION_EDIT_BILLED_SECS));
            let content = format!(
                "Action {} rejected by content moderation, billed {:.1}s of {:.1}s",
                prev.action, MODERATION_EDIT_BILLED_SECS, EDIT_DURATION_CAP_SECS
            );
            return LedgerEffect::Settle {
                previous: prev.quota,
                actual,
                entry: audit_entry(prev, LogType::Settle, content, other),
            };
        }

        let mut other = base_other(prev);
        other.insert("moderation".into(), json!(true));
        let content = format!(
            "Task rejected by content moderation, charge of {} kept",
            prev.quota
        );
        return LedgerEffect::Record {
            entry: audit_entry(prev, LogType::System, content, other),
        };
    }

    next.quota = 0;
    let content = format!("Task {} failed, refund {}", prev.task_id, prev.quota);
    LedgerEffect::Refund {
        amount: prev.quota,
        entry: audit_entry(prev, LogType::Refund, content, base_other(prev)),
    }
}

fn success_effect(prev: &Task, next: &mut Task, poll: &PollResult, pricing: &PricingTable) -> LedgerEffect {
    if let Some(tokens) = poll.total_tokens.filter(|t| *t > 0) {
        let ratio = [
            poll.model.as_deref().unwrap_or_default(),
            prev.properties.upstream_model_name.as_str(),
            prev.properties.origin_model_name.as_str(),
        ]
        .into_iter()
        .filter(|model| !model.is_empty())
        .find_map(|model| pricing.model_ratio(model));
        if let Some(model_ratio) = ratio {
            let user_group = if prev.private_data.user_group.is_empty() {
                prev.group.as_str()
            } else {
                prev.private_data.user_group.as_str()
            };
            let group_ratio = pricing.effective_group_ratio(user_group, &prev.group);
            let actual = (tokens as f64 * model_ratio * group_ratio) as i64;
            next.quota = actual;

            let mut other = base_other(prev);
            other.insert("model_ratio".into(), json!(model_ratio));
            other.insert("group_ratio".into(), json!(group_ratio));
            other.insert("total_tokens".into(), json!(tokens));
            let content = format!(
                "Token-metered settlement, model ratio {:.2}, group ratio {:.2}, tokens {}, reserved {}, actual {}",
                model_ratio, group_ratio, tokens, prev.quota, actual
            );
            return LedgerEffect::Settle {
                previous: prev.quota,
                actual,
                entry: audit_entry(prev, LogType::Settle, content, other),
            };
        }
    }

    if let Some(duration) = poll.duration.filter(|d| *d > 0.0) {
        if prev.action == TaskAction::Edit && prev.quota > 0 {
            let billed = duration.min(EDIT_DURATION_CAP_SECS);
            let actual = prorate(prev.quota, billed);
            next.quota = actual;

            let mut other = base_other(prev);
            other.insert("billed_seconds".into(), json!(billed));
            other.insert("actual_seconds".into(), json!(duration));
            let content = format!(
                "Action {}, actual video {:.1}s of {:.1}s, reserved {}, actual {}",
                prev.action, billed, EDIT_DURATION_CAP_SECS, prev.quota, actual
            );
            return LedgerEffect::Settle {
                previous: prev.quota,
                actual,
                entry: audit_entry(prev, LogType::Settle, content, other),
            };
        }
    }

    LedgerEffect::None
}

/// `max(1, floor(quota × min(seconds, cap) / cap))`; the full quota at or
/// above the cap.
fn prorate(quota: i64, seconds: f64) -> i64 {
    if seconds >= EDIT_DURATION_CAP_SECS {
        return quota;
    }
    ((quota as f64 * seconds / EDIT_DURATION_CAP_SECS) as i64).max(1)
}

fn base_other(task: &Task) -> Map<String, Value> {
    let mut other = Map::new();
    other.insert("task_id".into(), json!(task.task_id));
    if !task.properties.request_path.is_empty() {
        other.insert("request_path".into(), json!(task.properties.request_path));
    }
    if task.properties.default_price {
        other.insert("default_price".into(), json!(true));
    }
    other
}

fn audit_entry(task: &Task, log_type: LogType, content: String, other: Map<String, Value>) -> AuditEntry {
    AuditEntry {
        log_type,
        user_id: task.user_id,
        channel_id: task.channel_id,
        token_id: task.private_data.token_id,
        token_name: task.private_data.token_name.clone(),
        model_name: task.model_name().to_string(),
        group: task.group.clone(),
        task_id: Some(task.task_id.clone()),
        quota: 0,
        content,
        other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::store::tests::new_task;

    fn pending(quota: i64) -> Task {
        new_task(1, 1, "t-1", quota)
    }

    fn success_with_duration(d: f64) -> PollResult {
        PollResult {
            status: Some(TaskStatus::Success),
            result_url: Some("https://cdn/x.mp4".into()),
            duration: Some(d),
            ..Default::default()
        }
    }

    fn failure(reason: &str) -> PollResult {
        PollResult {
            status: Some(TaskStatus::Failure),
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_poll_changes_nothing() {
        let task = pending(100);
        let t = apply_poll(&task, &PollResult::unknown(), &PricingTable::default(), 50);
        assert!(t.is_noop(&task));
    }

    #[test]
    fn test_status_never_moves_backward() {
        let mut task = pending(100);
        task.status = TaskStatus::InProgress;
        task.start_time = 7;
        let t = apply_poll(&task, &PollResult::with_status(TaskStatus::Queued), &PricingTable::default(), 50);
        assert_eq!(t.next.status, TaskStatus::InProgress);
        assert_eq!(t.next.start_time, 7);
    }

    #[test]
    fn test_first_in_progress_sets_start_time() {
        let task = pending(100);
        let t = apply_poll(&task, &PollResult::with_status(TaskStatus::InProgress), &PricingTable::default(), 42);
        assert_eq!(t.next.status, TaskStatus::InProgress);
        assert_eq!(t.next.start_time, 42);
        assert_eq!(t.next.progress, "30%");
        assert!(t.effect.is_none());
    }

    #[test]
    fn test_plain_success_keeps_charge() {
        let task = pending(100);
        let t = apply_poll(&task, &success_with_duration(3.0), &PricingTable::default(), 60);
        assert_eq!(t.next.status, TaskStatus::Success);
        assert_eq!(t.next.quota, 100);
        assert_eq!(t.next.fail_reason, "https://cdn/x.mp4");
        assert_eq!(t.next.finish_time, 60);
        assert!(t.effect.is_none());
    }

    #[test]
    fn test_edit_duration_settlement() {
        let mut task = pending(250_000);
        task.action = TaskAction::Edit;
        let t = apply_poll(&task, &success_with_duration(4.0), &PricingTable::default(), 60);
        let settled = (250_000f64 * 4.0 / 8.7) as i64;
        assert_eq!(settled, 114_942);
        assert_eq!(t.next.quota, settled);
        match t.effect {
            LedgerEffect::Settle { previous, actual, .. } => {
                assert_eq!(previous, 250_000);
                assert_eq!(actual, settled);
                assert_eq!(previous - actual, 250_000 - 114_942);
            }
            other => panic!("unexpected effect {:?}", other),
        }
    }

    #[test]
    fn test_edit_duration_floor_and_cap() {
        let mut task = pending(3);
        task.action = TaskAction::Edit;
        let t = apply_poll(&task, &success_with_duration(0.1), &PricingTable::default(), 60);
        assert_eq!(t.next.quota, 1);

        let mut task = pending(1000);
        task.action = TaskAction::Edit;
        let t = apply_poll(&task, &success_with_duration(12.0), &PricingTable::default(), 60);
        assert_eq!(t.next.quota, 1000);
    }

    #[test]
    fn test_token_metered_settlement() {
        let mut pricing = PricingTable::default();
        pricing
            .model_ratio
            .insert("grok-imagine-video".into(), 2.0);
        pricing.group_ratio.insert("default".into(), 0.5);
        let task = pending(1000);
        let poll = PollResult {
            status: Some(TaskStatus::Success),
            total_tokens: Some(300),
            ..Default::default()
        };
        let t = apply_poll(&task, &poll, &pricing, 60);
        assert_eq!(t.next.quota, 300);
        assert!(matches!(
            t.effect,
            LedgerEffect::Settle {
                previous: 1000,
                actual: 300,
                ..
            }
        ));
    }

    #[test]
    fn test_inline_result_is_not_stored() {
        let task = pending(100);
        let poll = PollResult {
            status: Some(TaskStatus::Success),
            result_url: Some(format!("data:video/mp4;base64,{}", "A".repeat(100_000))),
            ..Default::default()
        };
        let t = apply_poll(&task, &poll, &PricingTable::default(), 60);
        assert_eq!(t.next.status, TaskStatus::Success);
        assert!(t.next.fail_reason.is_empty());
        assert_eq!(t.next.result_url(), None);
    }

    #[test]
    fn test_token_ratio_prefers_reported_model() {
        let mut pricing = PricingTable::default();
        pricing
            .model_ratio
            .insert("doubao-seedance-1-0-pro-250528".into(), 1.0);
        let mut task = pending(1000);
        task.properties.origin_model_name = "seedance".into();
        task.properties.upstream_model_name = "doubao-seedance-1-0-pro-250528".into();
        task.properties.is_model_mapped = true;

        let poll = PollResult {
            status: Some(TaskStatus::Success),
            total_tokens: Some(300),
            model: Some("doubao-seedance-1-0-pro-250528".into()),
            ..Default::default()
        };
        let t = apply_poll(&task, &poll, &pricing, 60);
        assert_eq!(t.next.quota, 300);
        assert!(matches!(t.effect, LedgerEffect::Settle { previous: 1000, actual: 300, .. }));

        // Without a reported model the mapped upstream name still prices it.
        let poll = PollResult {
            model: None,
            ..poll
        };
        let t = apply_poll(&task, &poll, &pricing, 60);
        assert_eq!(t.next.quota, 300);
    }

    #[test]
    fn test_failure_refunds_in_full() {
        let task = pending(500);
        let t = apply_poll(&task, &failure("upstream error"), &PricingTable::default(), 60);
        assert_eq!(t.next.status, TaskStatus::Failure);
        assert_eq!(t.next.quota, 0);
        assert_eq!(t.next.fail_reason, "upstream error");
        assert!(matches!(t.effect, LedgerEffect::Refund { amount: 500, .. }));
    }

    #[test]
    fn test_moderation_on_edit_charges_policy_amount() {
        let mut task = pending(250_000);
        task.action = TaskAction::Edit;
        let t = apply_poll(&task, &failure("Blocked by Content Moderation"), &PricingTable::default(), 60);
        assert_eq!(t.next.quota, 229_885);
        assert!(matches!(t.effect, LedgerEffect::Settle { actual: 229_885, .. }));
    }

    #[test]
    fn test_moderation_on_generate_keeps_charge() {
        let task = pending(500);
        let t = apply_poll(&task, &failure("content moderation"), &PricingTable::default(), 60);
        assert_eq!(t.next.quota, 500);
        match t.effect {
            LedgerEffect::Record { entry } => {
                assert_eq!(entry.other.get("moderation"), Some(&json!(true)));
            }
            other => panic!("unexpected effect {:?}", other),
        }
    }

    #[test]
    fn test_terminal_task_only_takes_progress() {
        let mut task = pending(0);
        task.status = TaskStatus::Failure;
        task.progress = "100%".into();
        let mut poll = failure("again");
        poll.progress = Some("99%".into());
        let t = apply_poll(&task, &poll, &PricingTable::default(), 60);
        assert!(t.effect.is_none());
        assert_eq!(t.next.status, TaskStatus::Failure);
        assert_eq!(t.next.progress, "99%");
        assert_eq!(t.next.fail_reason, task.fail_reason);
    }

    #[test]
    fn test_expire_refunds() {
        let mut task = pending(80);
        task.properties.default_price = true;
        let t = expire(&task, TIMEOUT_REASON, 99);
        assert_eq!(t.next.status, TaskStatus::Failure);
        assert_eq!(t.next.fail_reason, "timed out");
        match t.effect {
            LedgerEffect::Refund { amount, entry } => {
                assert_eq!(amount, 80);
                assert_eq!(entry.other.get("default_price"), Some(&json!(true)));
            }
            other => panic!("unexpected effect {:?}", other),
        }
    }
}
