//! Quota ledger: per-user balance mutations and their audit log.
//!
//! Every function takes a `&Connection` so callers can run it inside the
//! same transaction as the task update that justifies the mutation. Each
//! economic effect writes exactly one row to `logs`.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::storage::{now_unix, Database};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("user quota is not enough: balance {balance}, needed {needed}")]
    InsufficientQuota { balance: i64, needed: i64 },

    #[error("user {0} not found")]
    UserNotFound(i64),

    #[error("ledger storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("audit serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    /// Reservation at submission.
    Consume,
    /// Deferred adjustment of a reservation (debit or credit).
    Settle,
    /// Full refund of a reservation.
    Refund,
    /// Administrative or informational entry.
    System,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consume => "consume",
            Self::Settle => "settle",
            Self::Refund => "refund",
            Self::System => "system",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "consume" => Self::Consume,
            "settle" => Self::Settle,
            "refund" => Self::Refund,
            _ => Self::System,
        }
    }
}

/// One audit record. `quota` is signed from the user's point of view of
/// spend: positive is a charge, negative a credit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub log_type: LogType,
    pub user_id: i64,
    pub channel_id: i64,
    pub token_id: Option<i64>,
    pub token_name: String,
    pub model_name: String,
    pub group: String,
    pub task_id: Option<String>,
    pub quota: i64,
    pub content: String,
    pub other: Map<String, Value>,
}

/// Persisted audit record.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub id: i64,
    pub created_at: i64,
    #[serde(flatten)]
    pub entry: AuditEntry,
}

/// Current balance of a user.
pub fn user_balance(conn: &Connection, user_id: i64) -> Result<i64, LedgerError> {
    conn.query_row(
        "SELECT quota FROM users WHERE id = ?1",
        params![user_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(LedgerError::UserNotFound(user_id))
}

/// Pre-flight check before submitting upstream. Does not mutate anything.
pub fn check_reserve(conn: &Connection, user_id: i64, amount: i64) -> Result<(), LedgerError> {
    let balance = user_balance(conn, user_id)?;
    if balance - amount < 0 {
        return Err(LedgerError::InsufficientQuota {
            balance,
            needed: amount,
        });
    }
    Ok(())
}

/// Debit a reservation, only if the balance still covers it.
///
/// The balance may have moved since `check_reserve`; this is the
/// authoritative check.
pub fn debit_reserved(
    conn: &Connection,
    user_id: i64,
    channel_id: i64,
    amount: i64,
) -> Result<(), LedgerError> {
    let updated = conn.execute(
        "UPDATE users
         SET quota = quota - ?1, used_quota = used_quota + ?1, request_count = request_count + 1
         WHERE id = ?2 AND quota >= ?1",
        params![amount, user_id],
    )?;
    if updated == 0 {
        let balance = user_balance(conn, user_id)?;
        return Err(LedgerError::InsufficientQuota {
            balance,
            needed: amount,
        });
    }
    bump_channel(conn, channel_id, amount)?;
    Ok(())
}

/// Unconditional debit. The balance may go negative.
fn debit(conn: &Connection, user_id: i64, channel_id: i64, amount: i64) -> Result<(), LedgerError> {
    let updated = conn.execute(
        "UPDATE users SET quota = quota - ?1, used_quota = used_quota + ?1 WHERE id = ?2",
        params![amount, user_id],
    )?;
    if updated == 0 {
        return Err(LedgerError::UserNotFound(user_id));
    }
    bump_channel(conn, channel_id, amount)
}

fn credit(conn: &Connection, user_id: i64, channel_id: i64, amount: i64) -> Result<(), LedgerError> {
    let updated = conn.execute(
        "UPDATE users SET quota = quota + ?1, used_quota = MAX(used_quota - ?1, 0) WHERE id = ?2",
        params![amount, user_id],
    )?;
    if updated == 0 {
        return Err(LedgerError::UserNotFound(user_id));
    }
    bump_channel(conn, channel_id, -amount)
}

fn bump_channel(conn: &Connection, channel_id: i64, amount: i64) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE channels SET used_quota = used_quota + ?1 WHERE id = ?2",
        params![amount, channel_id],
    )?;
    Ok(())
}

/// Administrative credit, logged as a system entry.
pub fn top_up(conn: &Connection, user_id: i64, amount: i64) -> Result<i64, LedgerError> {
    let updated = conn.execute(
        "UPDATE users SET quota = quota + ?1 WHERE id = ?2",
        params![amount, user_id],
    )?;
    if updated == 0 {
        return Err(LedgerError::UserNotFound(user_id));
    }
    record(
        conn,
        &AuditEntry {
            log_type: LogType::System,
            user_id,
            channel_id: 0,
            token_id: None,
            token_name: String::new(),
            model_name: String::new(),
            group: String::new(),
            task_id: None,
            quota: -amount,
            content: format!("Administrator top-up of {} quota", amount),
            other: Map::new(),
        },
    )?;
    user_balance(conn, user_id)
}

/// Append an audit record.
pub fn record(conn: &Connection, entry: &AuditEntry) -> Result<i64, LedgerError> {
    let other = serde_json::to_string(&entry.other)?;
    conn.execute(
        "INSERT INTO logs (created_at, log_type, user_id, channel_id, token_id, token_name,
                           model_name, log_group, task_id, quota, content, other)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            now_unix(),
            entry.log_type.as_str(),
            entry.user_id,
            entry.channel_id,
            entry.token_id,
            entry.token_name,
            entry.model_name,
            entry.group,
            entry.task_id,
            entry.quota,
            entry.content,
            other,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent audit records, newest first.
pub fn list_logs(
    conn: &Connection,
    user_id: Option<i64>,
    limit: i64,
) -> Result<Vec<LogRecord>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT id, created_at, log_type, user_id, channel_id, token_id, token_name,
                model_name, log_group, task_id, quota, content, other
         FROM logs
         WHERE ?1 IS NULL OR user_id = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![user_id, limit], |row| {
        let log_type: String = row.get(2)?;
        let other: String = row.get(12)?;
        let other = serde_json::from_str(&other).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(LogRecord {
            id: row.get(0)?,
            created_at: row.get(1)?,
            entry: AuditEntry {
                log_type: LogType::parse(&log_type),
                user_id: row.get(3)?,
                channel_id: row.get(4)?,
                token_id: row.get(5)?,
                token_name: row.get(6)?,
                model_name: row.get(7)?,
                group: row.get(8)?,
                task_id: row.get(9)?,
                quota: row.get(10)?,
                content: row.get(11)?,
                other,
            },
        })
    })?;
    let logs = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(logs)
}

/// Billing consequence of one task transition.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEffect {
    None,
    /// Adjust `previous` to `actual`; the entry quota is overwritten with the delta.
    Settle {
        previous: i64,
        actual: i64,
        entry: AuditEntry,
    },
    /// Credit `amount` back in full.
    Refund { amount: i64, entry: AuditEntry },
    /// Informational entry with no balance change.
    Record { entry: AuditEntry },
}

impl LedgerEffect {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Apply the effect. Returns the change to the user's balance
    /// (negative for a charge).
    pub fn apply(&self, conn: &Connection) -> Result<i64, LedgerError> {
        match self {
            Self::None => Ok(0),
            Self::Settle {
                previous,
                actual,
                entry,
            } => settle(conn, *previous, *actual, entry),
            Self::Refund { amount, entry } => refund(conn, *amount, entry),
            Self::Record { entry } => {
                record(
                    conn,
                    &AuditEntry {
                        quota: 0,
                        ..entry.clone()
                    },
                )?;
                Ok(0)
            }
        }
    }
}

/// Move a reservation from `previous` to `actual`.
pub fn settle(
    conn: &Connection,
    previous: i64,
    actual: i64,
    entry: &AuditEntry,
) -> Result<i64, LedgerError> {
    let delta = actual - previous;
    if delta > 0 {
        debit(conn, entry.user_id, entry.channel_id, delta)?;
    } else if delta < 0 {
        credit(conn, entry.user_id, entry.channel_id, -delta)?;
    }
    record(
        conn,
        &AuditEntry {
            log_type: LogType::Settle,
            quota: delta,
            ..entry.clone()
        },
    )?;
    Ok(-delta)
}

/// Credit a full refund.
pub fn refund(conn: &Connection, amount: i64, entry: &AuditEntry) -> Result<i64, LedgerError> {
    if amount <= 0 {
        return Ok(0);
    }
    credit(conn, entry.user_id, entry.channel_id, amount)?;
    record(
        conn,
        &AuditEntry {
            log_type: LogType::Refund,
            quota: -amount,
            ..entry.clone()
        },
    )?;
    Ok(amount)
}

fn mirror_token(conn: &Connection, token_id: i64, balance_delta: i64) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE tokens
         SET remain_quota = CASE WHEN unlimited_quota = 1 THEN remain_quota ELSE remain_quota + ?1 END,
             used_quota = MAX(used_quota - ?1, 0)
         WHERE id = ?2",
        params![balance_delta, token_id],
    )?;
    Ok(())
}

/// Mirror a committed user-balance change onto the token balance.
///
/// Runs outside the task transaction; a failure is logged and does not
/// roll back the user balance.
pub fn mirror_token_best_effort(db: &Database, token_id: Option<i64>, balance_delta: i64) {
    let Some(token_id) = token_id else {
        return;
    };
    if balance_delta == 0 {
        return;
    }
    let conn = db.lock();
    if let Err(e) = mirror_token(&conn, token_id, balance_delta) {
        tracing::warn!(
            "Failed to mirror quota change {} onto token {}: {}",
            balance_delta,
            token_id,
            e
        );
    }
}
