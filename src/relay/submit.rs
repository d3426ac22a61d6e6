//! Submission flow: resolve channel and model, price, reserve, submit
//! upstream, persist.
//!
//! The balance is checked before the upstream call and debited only when
//! the task row is written, in the same transaction as the consume log.

use std::sync::Arc;

use serde_json::json;

use crate::account::{ApiToken, Channel, ChannelStore, User};
use crate::billing::ledger::{self, AuditEntry, LedgerError, LogType};
use crate::billing::{
    parse_mapping_table, resolve_model_mapping, resolve_pricing, ResolvedModel, SharedPricingStore,
};
use crate::error::{GatewayError, GatewayResult};
use crate::provider::{AdaptorRegistry, Platform, SubmitContext, VideoRequest};
use crate::storage::now_unix;
use crate::task::{
    redact_payload, StoreError, Task, TaskAction, TaskPrivateData, TaskProperties, TaskStatus,
    TaskStore,
};

/// Authenticated caller of a relay route.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user: User,
    pub token: ApiToken,
}

/// One client submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub action: TaskAction,
    pub request_path: String,
    /// Provider id of the video being remixed.
    pub origin_task_id: Option<String>,
    pub body: VideoRequest,
}

#[derive(Clone)]
pub struct Submitter {
    tasks: TaskStore,
    channels: ChannelStore,
    registry: Arc<AdaptorRegistry>,
    pricing: SharedPricingStore,
}

impl Submitter {
    pub fn new(
        tasks: TaskStore,
        channels: ChannelStore,
        registry: Arc<AdaptorRegistry>,
        pricing: SharedPricingStore,
    ) -> Self {
        Self {
            tasks,
            channels,
            registry,
            pricing,
        }
    }

    pub async fn submit(&self, caller: &Caller, request: SubmitRequest) -> GatewayResult<Task> {
        let user = &caller.user;
        let token = &caller.token;

        let origin = match &request.origin_task_id {
            Some(origin_id) => Some(
                self.tasks
                    .get_by_task_id(user.id, origin_id)?
                    .ok_or(GatewayError::TaskNotFound)?,
            ),
            None => None,
        };

        let platform = self.resolve_platform(origin.as_ref(), &request.body)?;
        let requested_model = match &origin {
            Some(o) => o.model_name().to_string(),
            None => request
                .body
                .model_name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}_{}", platform, request.action)),
        };

        let channel = self.resolve_channel(origin.as_ref(), platform, &requested_model)?;
        let adaptor = self
            .registry
            .get(platform)
            .ok_or_else(|| GatewayError::Internal(format!("no adaptor for platform {}", platform)))?;

        let resolved = match &origin {
            Some(o) => ResolvedModel {
                origin: o.properties.origin_model_name.clone(),
                upstream: o.properties.upstream_model_name.clone(),
                mapped: o.properties.is_model_mapped,
            },
            None => {
                let table = parse_mapping_table(&channel.model_mapping)?;
                resolve_model_mapping(&requested_model, &table)?
            }
        };

        let explicit_model = origin.is_some() || request.body.model_name().is_some();
        let ctx = SubmitContext {
            action: request.action,
            origin: origin.as_ref(),
        };
        let prepared = adaptor.validate_and_prepare(request.body, &ctx)?;

        // A derived model name follows the action the adaptor settled on.
        let pricing_model = if explicit_model {
            resolved.origin.clone()
        } else {
            format!("{}_{}", platform, prepared.action)
        };

        let table = self.pricing.snapshot().await;
        let using_group = token.using_group(user).to_string();
        let pricing = resolve_pricing(
            &table,
            &pricing_model,
            &using_group,
            &user.group,
            &prepared.hints,
        );

        {
            let conn = self.tasks.database().lock();
            ledger::check_reserve(&conn, user.id, pricing.quota)?;
        }

        // A derived name is a pricing key; unless the channel maps it, the
        // vendor gets its default model.
        let upstream_model = if explicit_model || resolved.mapped {
            resolved.upstream.clone()
        } else {
            adaptor
                .models()
                .first()
                .map(|m| m.to_string())
                .unwrap_or_else(|| pricing_model.clone())
        };
        let submission = adaptor
            .submit(&channel, &prepared, &upstream_model)
            .await
            .map_err(|e| {
                tracing::warn!(
                    "Upstream submission to channel {} failed: {}",
                    channel.id,
                    e
                );
                GatewayError::from(e)
            })?;

        let now = now_unix();
        let task = Task {
            id: 0,
            task_id: submission.task_id.clone(),
            platform,
            user_id: user.id,
            channel_id: channel.id,
            action: prepared.action,
            status: TaskStatus::Submitted,
            progress: TaskStatus::Submitted.default_progress().to_string(),
            submit_time: now,
            start_time: 0,
            finish_time: 0,
            quota: pricing.quota,
            group: using_group.clone(),
            data: redact_payload(&submission.body),
            fail_reason: String::new(),
            properties: TaskProperties {
                origin_model_name: pricing_model.clone(),
                upstream_model_name: upstream_model,
                is_model_mapped: resolved.mapped,
                request_path: request.request_path.clone(),
                seconds: prepared.seconds,
                size: prepared.size.clone(),
                default_price: pricing.is_fallback(),
            },
            private_data: TaskPrivateData {
                token_id: Some(token.id),
                token_name: token.name.clone(),
                user_group: user.group.clone(),
            },
            created_at: now,
            updated_at: now,
        };

        let mut other = pricing.audit_other();
        other.insert("request_path".into(), json!(request.request_path));
        other.insert("task_id".into(), json!(task.task_id));
        if resolved.mapped {
            other.insert("upstream_model_name".into(), json!(task.properties.upstream_model_name));
        }
        let consume = AuditEntry {
            log_type: LogType::Consume,
            user_id: user.id,
            channel_id: channel.id,
            token_id: Some(token.id),
            token_name: token.name.clone(),
            model_name: pricing_model,
            group: using_group,
            task_id: Some(task.task_id.clone()),
            quota: pricing.quota,
            content: pricing.describe(prepared.action.as_str()),
            other,
        };

        let task = match self.tasks.create_reserved(task, &consume) {
            Ok(task) => task,
            Err(StoreError::Ledger(LedgerError::InsufficientQuota { balance, needed })) => {
                tracing::warn!(
                    "Balance of user {} dropped to {} during submission (needed {}); upstream job {} on channel {} is orphaned",
                    user.id,
                    balance,
                    needed,
                    submission.task_id,
                    channel.id
                );
                return Err(GatewayError::InsufficientQuota);
            }
            Err(e) => {
                tracing::error!(
                    "Failed to persist task {} for user {}: {}",
                    submission.task_id,
                    user.id,
                    e
                );
                return Err(e.into());
            }
        };

        ledger::mirror_token_best_effort(self.tasks.database(), Some(token.id), -task.quota);
        Ok(task)
    }

    fn resolve_platform(&self, origin: Option<&Task>, body: &VideoRequest) -> GatewayResult<Platform> {
        if let Some(origin) = origin {
            return Ok(origin.platform);
        }
        if let Some(platform) = body.platform {
            return Ok(platform);
        }
        let model = body
            .model_name()
            .ok_or_else(|| GatewayError::validation("invalid_request", "model or platform is required"))?;
        if let Some(platform) = self.registry.platform_for_model(model) {
            return Ok(platform);
        }
        self.channels.platform_listing(model)?.ok_or_else(|| {
            GatewayError::validation(
                "model_not_found",
                format!("no platform serves model {}", model),
            )
        })
    }

    fn resolve_channel(
        &self,
        origin: Option<&Task>,
        platform: Platform,
        model: &str,
    ) -> GatewayResult<Channel> {
        if let Some(origin) = origin {
            return match self.channels.get(origin.channel_id)? {
                Some(channel) if channel.is_enabled() => Ok(channel),
                _ => Err(GatewayError::validation(
                    "task_channel_disable",
                    "the channel of the origin task is disabled",
                )),
            };
        }
        self.channels
            .select(platform, model)?
            .ok_or_else(|| GatewayError::Upstream {
                status: 503,
                code: "no_available_channel",
                message: format!("no available channel for model {} on {}", model, platform),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::ledger::{list_logs, user_balance};
    use crate::billing::{PricingStore, PricingTable};
    use crate::relay::tests::{seed_caller, seed_channel, ScriptedAdaptor};
    use crate::storage::Database;
    use serde_json::json;

    fn priced_table() -> PricingTable {
        let mut table = PricingTable::default();
        table.model_price.insert("grok-imagine-video".into(), 0.1);
        table
    }

    fn submitter(db: &Database, adaptor: Arc<ScriptedAdaptor>, table: PricingTable) -> Submitter {
        let mut registry = AdaptorRegistry::new();
        registry.register(adaptor);
        Submitter::new(
            TaskStore::new(db.clone()),
            ChannelStore::new(db.clone()),
            Arc::new(registry),
            Arc::new(PricingStore::in_memory(table)),
        )
    }

    fn request(body: serde_json::Value) -> SubmitRequest {
        SubmitRequest {
            action: TaskAction::Generate,
            request_path: "/v1/video/generations".into(),
            origin_task_id: None,
            body: serde_json::from_value(body).unwrap(),
        }
    }

    fn token_remain(db: &Database, token_id: i64) -> i64 {
        db.lock()
            .query_row("SELECT remain_quota FROM tokens WHERE id = ?1", [token_id], |r| r.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_reserves_and_logs() {
        let db = Database::open_in_memory().unwrap();
        let caller = seed_caller(&db, 1_000_000);
        let channel = seed_channel(&db, None);
        let adaptor = Arc::new(ScriptedAdaptor::new(json!({})));
        let submitter = submitter(&db, adaptor.clone(), priced_table());

        let task = submitter
            .submit(
                &caller,
                request(json!({"model": "grok-imagine-video", "prompt": "a cat", "duration": 5})),
            )
            .await
            .unwrap();

        // 0.1 x 5 seconds x 500000
        assert_eq!(task.quota, 250_000);
        assert_eq!(task.status, TaskStatus::Submitted);
        assert_eq!(task.progress, "10%");
        assert_eq!(task.channel_id, channel.id);
        assert_eq!(task.properties.seconds, Some(5.0));
        assert_eq!(task.private_data.token_id, Some(caller.token.id));
        assert_eq!(adaptor.submits(), 1);

        assert_eq!(user_balance(&db.lock(), caller.user.id).unwrap(), 750_000);
        assert_eq!(token_remain(&db, caller.token.id), 750_000);

        let logs = list_logs(&db.lock(), Some(caller.user.id), 10).unwrap();
        assert_eq!(logs.len(), 1);
        let consume = &logs[0].entry;
        assert_eq!(consume.log_type, LogType::Consume);
        assert_eq!(consume.quota, 250_000);
        assert_eq!(consume.other["model_price"], json!(0.1));
        assert_eq!(consume.other["request_path"], json!("/v1/video/generations"));
        assert!(consume.other.get("default_price").is_none());
        assert!(consume.content.contains("seconds: 5.00"));
    }

    #[tokio::test]
    async fn test_mapping_cycle_rejected_before_charge() {
        let db = Database::open_in_memory().unwrap();
        let caller = seed_caller(&db, 1_000_000);
        seed_channel(
            &db,
            Some(json!({"grok-imagine-video": "alias", "alias": "grok-imagine-video"})),
        );
        let adaptor = Arc::new(ScriptedAdaptor::new(json!({})));
        let submitter = submitter(&db, adaptor.clone(), priced_table());

        let err = submitter
            .submit(&caller, request(json!({"model": "grok-imagine-video", "prompt": "p"})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ModelMappingCycle { .. }));
        assert_eq!(err.status().as_u16(), 400);
        assert_eq!(adaptor.submits(), 0);
        assert_eq!(user_balance(&db.lock(), caller.user.id).unwrap(), 1_000_000);
        assert!(TaskStore::new(db.clone()).list_unfinished().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_self_mapping_submits_unmapped() {
        let db = Database::open_in_memory().unwrap();
        let caller = seed_caller(&db, 1_000_000);
        seed_channel(&db, Some(json!({"grok-imagine-video": "grok-imagine-video"})));
        let submitter = submitter(&db, Arc::new(ScriptedAdaptor::new(json!({}))), priced_table());

        let task = submitter
            .submit(&caller, request(json!({"model": "grok-imagine-video", "prompt": "p"})))
            .await
            .unwrap();
        assert!(!task.properties.is_model_mapped);
        assert_eq!(task.properties.upstream_model_name, "grok-imagine-video");
    }

    #[tokio::test]
    async fn test_insufficient_quota_never_reaches_upstream() {
        let db = Database::open_in_memory().unwrap();
        let caller = seed_caller(&db, 1000);
        seed_channel(&db, None);
        let adaptor = Arc::new(ScriptedAdaptor::new(json!({})));
        let submitter = submitter(&db, adaptor.clone(), priced_table());

        let err = submitter
            .submit(&caller, request(json!({"model": "grok-imagine-video", "prompt": "p"})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientQuota));
        assert_eq!(err.status().as_u16(), 403);
        assert_eq!(adaptor.submits(), 0);
        assert_eq!(user_balance(&db.lock(), caller.user.id).unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_upstream_failure_creates_nothing() {
        let db = Database::open_in_memory().unwrap();
        let caller = seed_caller(&db, 1_000_000);
        seed_channel(&db, None);
        let adaptor = Arc::new(ScriptedAdaptor::new(json!({})));
        adaptor.fail_submits(true);
        let submitter = submitter(&db, adaptor, priced_table());

        let err = submitter
            .submit(&caller, request(json!({"model": "grok-imagine-video", "prompt": "p"})))
            .await
            .unwrap_err();
        assert!(err.status().is_server_error());
        assert_eq!(user_balance(&db.lock(), caller.user.id).unwrap(), 1_000_000);
        assert!(list_logs(&db.lock(), Some(caller.user.id), 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_derived_model_uses_fallback_price() {
        let db = Database::open_in_memory().unwrap();
        let caller = seed_caller(&db, 1_000_000);
        seed_channel(&db, None);
        let submitter = submitter(
            &db,
            Arc::new(ScriptedAdaptor::new(json!({}))),
            PricingTable::default(),
        );

        let task = submitter
            .submit(
                &caller,
                request(json!({"platform": "xai", "prompt": "p", "video": "https://v.mp4", "duration": 1})),
            )
            .await
            .unwrap();
        assert_eq!(task.action, TaskAction::Edit);
        assert_eq!(task.model_name(), "xai_edit");
        assert_eq!(task.properties.upstream_model_name, "grok-imagine-video");
        assert!(task.properties.default_price);

        let logs = list_logs(&db.lock(), Some(caller.user.id), 10).unwrap();
        assert_eq!(logs[0].entry.other["default_price"], json!(true));
    }

    #[tokio::test]
    async fn test_remix_requires_owned_origin() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_caller(&db, 1_000_000);
        let stranger = seed_caller(&db, 1_000_000);
        seed_channel(&db, None);
        let submitter = submitter(&db, Arc::new(ScriptedAdaptor::new(json!({}))), priced_table());

        let origin = submitter
            .submit(&owner, request(json!({"model": "grok-imagine-video", "prompt": "p"})))
            .await
            .unwrap();

        let remix = |id: &str| SubmitRequest {
            action: TaskAction::Remix,
            request_path: format!("/v1/videos/{}/remix", id),
            origin_task_id: Some(id.to_string()),
            body: serde_json::from_value(json!({"prompt": "again"})).unwrap(),
        };

        let err = submitter.submit(&stranger, remix(&origin.task_id)).await.unwrap_err();
        assert_eq!(err.code(), "task_not_exist");

        let task = submitter.submit(&owner, remix(&origin.task_id)).await.unwrap();
        assert_eq!(task.channel_id, origin.channel_id);
        assert_eq!(task.model_name(), "grok-imagine-video");

        ChannelStore::new(db.clone())
            .set_status(origin.channel_id, crate::account::Status::Disabled)
            .unwrap();
        let err = submitter.submit(&owner, remix(&origin.task_id)).await.unwrap_err();
        assert_eq!(err.code(), "task_channel_disable");
    }

    #[tokio::test]
    async fn test_no_channel_for_platform() {
        let db = Database::open_in_memory().unwrap();
        let caller = seed_caller(&db, 1_000_000);
        let submitter = submitter(&db, Arc::new(ScriptedAdaptor::new(json!({}))), priced_table());

        let err = submitter
            .submit(&caller, request(json!({"model": "grok-imagine-video", "prompt": "p"})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "no_available_channel");
        assert_eq!(err.status().as_u16(), 503);
    }
}
