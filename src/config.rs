//! Process configuration loaded from environment variables.
//!
//! All values have defaults except `ADMIN_PASSWORD`; without it the admin
//! routes stay disabled.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Directory holding the database and `pricing.json`.
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    /// Interval between reconciliation sweeps.
    pub poll_interval: Duration,
    /// Maximum age of a non-terminal task before it is failed and refunded.
    /// `None` disables the timeout.
    pub task_timeout: Option<Duration>,
    /// Bound on every upstream submit/poll request.
    pub upstream_timeout: Duration,
    /// Maximum concurrent polls per sweep.
    pub poll_concurrency: usize,
    pub admin: Option<AdminAuth>,
}

/// Credentials for the admin dashboard routes.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    pub password: String,
    pub jwt_secret: String,
    pub jwt_ttl_days: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = env_or("TASKGATE_HOST", "127.0.0.1");
        let port = parse_env("TASKGATE_PORT", 3000u16)?;
        let data_dir = PathBuf::from(env_or("TASKGATE_DATA_DIR", "./data"));
        let database_path = std::env::var("TASKGATE_DATABASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("taskgate.db"));

        let poll_interval = Duration::from_secs(parse_env("TASK_POLL_INTERVAL_SECS", 15u64)?.max(1));
        let timeout_minutes = parse_env("TASK_TIMEOUT_MINUTES", 0u64)?;
        let task_timeout = (timeout_minutes > 0).then(|| Duration::from_secs(timeout_minutes * 60));
        let upstream_timeout = Duration::from_secs(parse_env("UPSTREAM_TIMEOUT_SECS", 30u64)?.max(1));
        let poll_concurrency = parse_env("TASK_POLL_CONCURRENCY", 8usize)?.max(1);

        let admin = match std::env::var("ADMIN_PASSWORD") {
            Ok(password) if !password.is_empty() => {
                let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
                    tracing::warn!("JWT_SECRET not set; deriving one from a random value for this process");
                    uuid::Uuid::new_v4().to_string()
                });
                Some(AdminAuth {
                    password,
                    jwt_secret,
                    jwt_ttl_days: parse_env("JWT_TTL_DAYS", 30i64)?,
                })
            }
            _ => None,
        };

        Ok(Self {
            host,
            port,
            data_dir,
            database_path,
            poll_interval,
            task_timeout,
            upstream_timeout,
            poll_concurrency,
            admin,
        })
    }

    pub fn pricing_path(&self) -> PathBuf {
        self.data_dir.join("pricing.json")
    }

    pub fn task_timeout_minutes(&self) -> Option<u64> {
        self.task_timeout.map(|d| d.as_secs() / 60)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid value for {}: {}", key, raw)),
        _ => Ok(default),
    }
}
