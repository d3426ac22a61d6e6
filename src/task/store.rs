//! Persisted task records.
//!
//! Writes that carry an economic effect go through `create_reserved` or
//! `commit`, which run the task write and the ledger mutation in one
//! transaction. `commit` is a compare-and-swap on the task's status.

use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use super::task::{Task, TaskAction, TaskStatus};
use crate::billing::ledger::{self, AuditEntry, LedgerEffect, LedgerError};
use crate::provider::Platform;
use crate::storage::{now_unix, Database};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("task serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result of a conditional task update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Row updated and ledger effect applied. `user_delta` is the change to
    /// the user's balance.
    Applied { user_delta: i64 },
    /// The stored status no longer matched; nothing was written.
    Conflict,
}

const TASK_COLUMNS: &str = "id, task_id, platform, user_id, channel_id, action, status, progress,
    submit_time, start_time, finish_time, quota, task_group, data, fail_reason,
    properties, private_data, created_at, updated_at";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let platform: String = row.get(2)?;
    let platform = platform.parse::<Platform>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let action: String = row.get(5)?;
    let status: String = row.get(6)?;
    let properties: String = row.get(15)?;
    let private_data: String = row.get(16)?;
    Ok(Task {
        id: row.get(0)?,
        task_id: row.get(1)?,
        platform,
        user_id: row.get(3)?,
        channel_id: row.get(4)?,
        action: TaskAction::parse(&action),
        status: TaskStatus::parse(&status),
        progress: row.get(7)?,
        submit_time: row.get(8)?,
        start_time: row.get(9)?,
        finish_time: row.get(10)?,
        quota: row.get(11)?,
        group: row.get(12)?,
        data: row.get(13)?,
        fail_reason: row.get(14)?,
        properties: serde_json::from_str(&properties).unwrap_or_default(),
        private_data: serde_json::from_str(&private_data).unwrap_or_default(),
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}

#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn get(&self, id: i64) -> Result<Option<Task>, StoreError> {
        let conn = self.db.lock();
        Ok(query_one(&conn, "id = ?1", params![id])?)
    }

    /// Look up a task by provider id, scoped to its owner.
    pub fn get_by_task_id(&self, user_id: i64, task_id: &str) -> Result<Option<Task>, StoreError> {
        let conn = self.db.lock();
        Ok(query_one(
            &conn,
            "user_id = ?1 AND task_id = ?2",
            params![user_id, task_id],
        )?)
    }

    /// Tasks owned by `user_id` among `task_ids`. Unknown ids are skipped.
    pub fn get_many(&self, user_id: i64, task_ids: &[String]) -> Result<Vec<Task>, StoreError> {
        let mut tasks = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            if let Some(task) = self.get_by_task_id(user_id, task_id)? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Every task not yet in a terminal status, oldest first.
    pub fn list_unfinished(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {} FROM tasks WHERE status NOT IN ('SUCCESS', 'FAILURE') ORDER BY id",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], task_from_row)?;
        let tasks = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Debit the reservation, insert the task and write the consume log,
    /// all or nothing.
    pub fn create_reserved(&self, mut task: Task, consume: &AuditEntry) -> Result<Task, StoreError> {
        let properties = serde_json::to_string(&task.properties)?;
        let private_data = serde_json::to_string(&task.private_data)?;
        let now = now_unix();

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        ledger::debit_reserved(&tx, task.user_id, task.channel_id, task.quota)?;

        tx.execute(
            "INSERT INTO tasks (task_id, platform, user_id, channel_id, action, status, progress,
                                submit_time, start_time, finish_time, quota, task_group, data,
                                fail_reason, properties, private_data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
            params![
                task.task_id,
                task.platform.as_str(),
                task.user_id,
                task.channel_id,
                task.action.as_str(),
                task.status.as_str(),
                task.progress,
                task.submit_time,
                task.start_time,
                task.finish_time,
                task.quota,
                task.group,
                task.data,
                task.fail_reason,
                properties,
                private_data,
                now,
            ],
        )?;
        task.id = tx.last_insert_rowid();
        task.created_at = now;
        task.updated_at = now;

        ledger::record(&tx, consume)?;
        tx.commit()?;

        tracing::info!(
            "Task {} created for user {} with quota {}",
            task.task_id,
            task.user_id,
            task.quota
        );
        Ok(task)
    }

    /// Write `next` only if the stored status is still `expected`, and apply
    /// `effect` in the same transaction.
    ///
    /// A ledger failure rolls back the task write too, so a task is never
    /// left terminal with its billing unresolved.
    pub fn commit(
        &self,
        expected: TaskStatus,
        next: &Task,
        effect: &LedgerEffect,
    ) -> Result<CommitOutcome, StoreError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE tasks
             SET status = ?1, progress = ?2, start_time = ?3, finish_time = ?4, quota = ?5,
                 data = ?6, fail_reason = ?7, updated_at = ?8
             WHERE id = ?9 AND status = ?10",
            params![
                next.status.as_str(),
                next.progress,
                next.start_time,
                next.finish_time,
                next.quota,
                next.data,
                next.fail_reason,
                now_unix(),
                next.id,
                expected.as_str(),
            ],
        )?;
        if updated == 0 {
            return Ok(CommitOutcome::Conflict);
        }

        let user_delta = effect.apply(&tx)?;
        tx.commit()?;
        Ok(CommitOutcome::Applied { user_delta })
    }
}

fn query_one(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Option<Task>> {
    let sql = format!("SELECT {} FROM tasks WHERE {} LIMIT 1", TASK_COLUMNS, filter);
    conn.query_row(&sql, params, task_from_row).optional()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::billing::ledger::{tests::seed_user, user_balance, LogType};
    use crate::task::task::{TaskPrivateData, TaskProperties};
    use serde_json::Map;

    pub(crate) fn new_task(user_id: i64, channel_id: i64, task_id: &str, quota: i64) -> Task {
        Task {
            id: 0,
            task_id: task_id.to_string(),
            platform: Platform::Xai,
            user_id,
            channel_id,
            action: TaskAction::Generate,
            status: TaskStatus::Submitted,
            progress: "10%".into(),
            submit_time: 1,
            start_time: 0,
            finish_time: 0,
            quota,
            group: "default".into(),
            data: String::new(),
            fail_reason: String::new(),
            properties: TaskProperties {
                origin_model_name: "grok-imagine-video".into(),
                ..Default::default()
            },
            private_data: TaskPrivateData::default(),
            created_at: 0,
            updated_at: 0,
        }
    }

    pub(crate) fn consume_entry(task: &Task) -> AuditEntry {
        AuditEntry {
            log_type: LogType::Consume,
            user_id: task.user_id,
            channel_id: task.channel_id,
            token_id: None,
            token_name: String::new(),
            model_name: task.model_name().to_string(),
            group: task.group.clone(),
            task_id: Some(task.task_id.clone()),
            quota: task.quota,
            content: String::new(),
            other: Map::new(),
        }
    }

    #[test]
    fn test_create_reserved_debits_and_inserts() {
        let db = Database::open_in_memory().unwrap();
        let (user, _, channel) = seed_user(&db, 1000);
        let store = TaskStore::new(db.clone());

        let task = new_task(user, channel, "t-1", 400);
        let created = store.create_reserved(task.clone(), &consume_entry(&task)).unwrap();
        assert!(created.id > 0);
        assert_eq!(user_balance(&db.lock(), user).unwrap(), 600);

        let loaded = store.get_by_task_id(user, "t-1").unwrap().unwrap();
        assert_eq!(loaded.quota, 400);
        assert_eq!(loaded.status, TaskStatus::Submitted);
        assert_eq!(loaded.properties.origin_model_name, "grok-imagine-video");
        assert!(store.get_by_task_id(user + 1, "t-1").unwrap().is_none());
    }

    #[test]
    fn test_create_reserved_rolls_back_on_insufficient_quota() {
        let db = Database::open_in_memory().unwrap();
        let (user, _, channel) = seed_user(&db, 100);
        let store = TaskStore::new(db.clone());

        let task = new_task(user, channel, "t-1", 101);
        let err = store.create_reserved(task.clone(), &consume_entry(&task)).unwrap_err();
        assert!(matches!(err, StoreError::Ledger(LedgerError::InsufficientQuota { .. })));
        assert!(store.get_by_task_id(user, "t-1").unwrap().is_none());
        assert_eq!(user_balance(&db.lock(), user).unwrap(), 100);
    }

    #[test]
    fn test_commit_is_compare_and_swap() {
        let db = Database::open_in_memory().unwrap();
        let (user, _, channel) = seed_user(&db, 1000);
        let store = TaskStore::new(db.clone());
        let task = new_task(user, channel, "t-1", 400);
        let task = store.create_reserved(task.clone(), &consume_entry(&task)).unwrap();

        let mut failed = task.clone();
        failed.status = TaskStatus::Failure;
        failed.quota = 0;
        let effect = LedgerEffect::Refund {
            amount: 400,
            entry: consume_entry(&task),
        };

        assert_eq!(
            store.commit(TaskStatus::Submitted, &failed, &effect).unwrap(),
            CommitOutcome::Applied { user_delta: 400 }
        );
        assert_eq!(
            store.commit(TaskStatus::Submitted, &failed, &effect).unwrap(),
            CommitOutcome::Conflict
        );
        assert_eq!(user_balance(&db.lock(), user).unwrap(), 1000);
        assert!(store.list_unfinished().unwrap().is_empty());
    }

    #[test]
    fn test_ledger_failure_rolls_back_status() {
        let db = Database::open_in_memory().unwrap();
        let (user, _, channel) = seed_user(&db, 1000);
        let store = TaskStore::new(db.clone());
        let task = new_task(user, channel, "t-1", 400);
        let task = store.create_reserved(task.clone(), &consume_entry(&task)).unwrap();

        let mut failed = task.clone();
        failed.status = TaskStatus::Failure;
        let mut entry = consume_entry(&task);
        entry.user_id = 9999;
        let effect = LedgerEffect::Refund { amount: 400, entry };

        assert!(store.commit(TaskStatus::Submitted, &failed, &effect).is_err());
        let reloaded = store.get(task.id).unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Submitted);
        assert_eq!(store.list_unfinished().unwrap().len(), 1);
    }
}
