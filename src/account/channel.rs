//! Upstream channels: one provider endpoint plus credentials.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Status;
use crate::provider::Platform;
use crate::storage::Database;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub platform: Platform,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub status: Status,
    /// Models served. Empty means any model of the platform.
    pub models: Vec<String>,
    /// Raw JSON redirect table, parsed at submission.
    pub model_mapping: String,
    pub used_quota: i64,
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.status.is_enabled()
    }

    pub fn serves(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewChannel {
    pub name: String,
    pub platform: Platform,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub model_mapping: Option<serde_json::Value>,
}

const CHANNEL_COLUMNS: &str =
    "id, name, platform, base_url, api_key, status, models, model_mapping, used_quota";

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    let platform: String = row.get(2)?;
    let platform = platform.parse::<Platform>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let models: String = row.get(6)?;
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        platform,
        base_url: row.get(3)?,
        api_key: row.get(4)?,
        status: Status::from_i64(row.get(5)?),
        models: serde_json::from_str(&models).unwrap_or_default(),
        model_mapping: row.get(7)?,
        used_quota: row.get(8)?,
    })
}

#[derive(Clone)]
pub struct ChannelStore {
    db: Database,
}

impl ChannelStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, new_channel: &NewChannel) -> rusqlite::Result<Channel> {
        let models = serde_json::to_string(&new_channel.models).unwrap_or_else(|_| "[]".into());
        let mapping = match &new_channel.model_mapping {
            Some(serde_json::Value::String(raw)) => raw.clone(),
            Some(value) => value.to_string(),
            None => "{}".to_string(),
        };
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO channels (name, platform, base_url, api_key, models, model_mapping)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new_channel.name,
                new_channel.platform.as_str(),
                new_channel.base_url,
                new_channel.api_key,
                models,
                mapping,
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(
            "Created channel {} ({}) for platform {}",
            new_channel.name,
            id,
            new_channel.platform
        );
        conn.query_row(
            &format!("SELECT {} FROM channels WHERE id = ?1", CHANNEL_COLUMNS),
            params![id],
            channel_from_row,
        )
    }

    pub fn get(&self, id: i64) -> rusqlite::Result<Option<Channel>> {
        let conn = self.db.lock();
        conn.query_row(
            &format!("SELECT {} FROM channels WHERE id = ?1", CHANNEL_COLUMNS),
            params![id],
            channel_from_row,
        )
        .optional()
    }

    /// Returns false when the channel does not exist.
    pub fn set_status(&self, id: i64, status: Status) -> rusqlite::Result<bool> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE channels SET status = ?1 WHERE id = ?2",
            params![status.as_i64(), id],
        )?;
        if updated > 0 {
            tracing::info!("Channel {} is now {:?}", id, status);
        }
        Ok(updated > 0)
    }

    /// First enabled channel of `platform` serving `model`.
    pub fn select(&self, platform: Platform, model: &str) -> rusqlite::Result<Option<Channel>> {
        Ok(self
            .list_for_platform(platform)?
            .into_iter()
            .find(|c| c.is_enabled() && c.serves(model)))
    }

    /// Platform of the first enabled channel listing `model` explicitly.
    pub fn platform_listing(&self, model: &str) -> rusqlite::Result<Option<Platform>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM channels WHERE status = 1 ORDER BY id",
            CHANNEL_COLUMNS
        ))?;
        let rows = stmt.query_map([], channel_from_row)?;
        for channel in rows {
            let channel = channel?;
            if channel.models.iter().any(|m| m == model) {
                return Ok(Some(channel.platform));
            }
        }
        Ok(None)
    }

    fn list_for_platform(&self, platform: Platform) -> rusqlite::Result<Vec<Channel>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM channels WHERE platform = ?1 ORDER BY id",
            CHANNEL_COLUMNS
        ))?;
        let rows = stmt.query_map(params![platform.as_str()], channel_from_row)?;
        let channels = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(channels)
    }
}
