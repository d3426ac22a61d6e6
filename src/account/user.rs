//! Users and their API tokens.

use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Status;
use crate::storage::Database;

const TOKEN_KEY_LEN: usize = 48;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub group: String,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiToken {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub name: String,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub used_quota: i64,
    /// Pricing group override for requests made with this token.
    pub group: Option<String>,
    pub status: Status,
}

impl ApiToken {
    /// Group used for pricing: the token override, else the owner's group.
    pub fn using_group<'a>(&'a self, user: &'a User) -> &'a str {
        self.group
            .as_deref()
            .filter(|g| !g.is_empty())
            .unwrap_or(&user.group)
    }

    pub fn is_exhausted(&self) -> bool {
        !self.unlimited_quota && self.remain_quota <= 0
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub username: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub quota: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewToken {
    pub user_id: i64,
    #[serde(default = "default_token_name")]
    pub name: String,
    #[serde(default)]
    pub remain_quota: i64,
    #[serde(default)]
    pub unlimited_quota: bool,
    #[serde(default)]
    pub group: Option<String>,
}

fn default_group() -> String {
    "default".to_string()
}

fn default_token_name() -> String {
    "default".to_string()
}

/// `sk-` followed by random alphanumerics.
pub fn generate_token_key() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_KEY_LEN)
        .map(char::from)
        .collect();
    format!("sk-{}", suffix)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        group: row.get(2)?,
        quota: row.get(3)?,
        used_quota: row.get(4)?,
        request_count: row.get(5)?,
        status: Status::from_i64(row.get(6)?),
    })
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<ApiToken> {
    let unlimited: i64 = row.get(5)?;
    Ok(ApiToken {
        id: row.get(0)?,
        user_id: row.get(1)?,
        key: row.get(2)?,
        name: row.get(3)?,
        remain_quota: row.get(4)?,
        unlimited_quota: unlimited != 0,
        used_quota: row.get(6)?,
        group: row.get(7)?,
        status: Status::from_i64(row.get(8)?),
    })
}

const USER_COLUMNS: &str = "id, username, user_group, quota, used_quota, request_count, status";
const TOKEN_COLUMNS: &str =
    "id, user_id, key, name, remain_quota, unlimited_quota, used_quota, token_group, status";

#[derive(Clone)]
pub struct AccountStore {
    db: Database,
}

impl AccountStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create_user(&self, new_user: &NewUser) -> rusqlite::Result<User> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO users (username, user_group, quota) VALUES (?1, ?2, ?3)",
            params![new_user.username, new_user.group, new_user.quota],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!("Created user {} ({})", new_user.username, id);
        conn.query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            params![id],
            user_from_row,
        )
    }

    pub fn get_user(&self, id: i64) -> rusqlite::Result<Option<User>> {
        let conn = self.db.lock();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            params![id],
            user_from_row,
        )
        .optional()
    }

    /// Issue a token. Fails if the user does not exist.
    pub fn create_token(&self, new_token: &NewToken) -> rusqlite::Result<ApiToken> {
        let conn = self.db.lock();
        let key = generate_token_key();
        conn.execute(
            "INSERT INTO tokens (user_id, key, name, remain_quota, unlimited_quota, token_group)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new_token.user_id,
                key,
                new_token.name,
                new_token.remain_quota,
                new_token.unlimited_quota as i64,
                new_token.group,
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {} FROM tokens WHERE id = ?1", TOKEN_COLUMNS),
            params![id],
            token_from_row,
        )
    }

    /// Resolve a bearer key to its token and owner. Disabled or exhausted
    /// tokens and disabled users resolve to `None`.
    pub fn authenticate(&self, key: &str) -> rusqlite::Result<Option<(User, ApiToken)>> {
        let conn = self.db.lock();
        let token = conn
            .query_row(
                &format!("SELECT {} FROM tokens WHERE key = ?1", TOKEN_COLUMNS),
                params![key],
                token_from_row,
            )
            .optional()?;
        let Some(token) = token else {
            return Ok(None);
        };
        if !token.status.is_enabled() || token.is_exhausted() {
            return Ok(None);
        }
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                params![token.user_id],
                user_from_row,
            )
            .optional()?;
        Ok(user
            .filter(|u| u.status.is_enabled())
            .map(|u| (u, token)))
    }
}
