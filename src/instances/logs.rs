//! Append-only deployment log (SQLite).
//!
//! There is deliberately no update or delete method here; the schema also
//! rejects both with triggers.

use super::Instance;
use crate::error::Result;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqlitePool};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Deploy,
    Cleanup,
    Start,
    Stop,
    Restart,
    Destroy,
    UpdateConfig,
    Redeploy,
}

impl LogAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LogAction::Deploy => "deploy",
            LogAction::Cleanup => "cleanup",
            LogAction::Start => "start",
            LogAction::Stop => "stop",
            LogAction::Restart => "restart",
            LogAction::Destroy => "destroy",
            LogAction::UpdateConfig => "update_config",
            LogAction::Redeploy => "redeploy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deploy" => Some(LogAction::Deploy),
            "cleanup" => Some(LogAction::Cleanup),
            "start" => Some(LogAction::Start),
            "stop" => Some(LogAction::Stop),
            "restart" => Some(LogAction::Restart),
            "destroy" => Some(LogAction::Destroy),
            "update_config" => Some(LogAction::UpdateConfig),
            "redeploy" => Some(LogAction::Redeploy),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Failure,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(LogStatus::Success),
            "failure" => Some(LogStatus::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub instance_id: String,
    pub user_id: String,
    pub action: LogAction,
    pub status: LogStatus,
    pub message: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeploymentLogStore {
    pool: SqlitePool,
}

impl DeploymentLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn success(&self, instance: &Instance, action: LogAction, message: impl Into<String>) -> Result<()> {
        self.append(instance, action, LogStatus::Success, &message.into(), None)
            .await
    }

    pub async fn failure(
        &self,
        instance: &Instance,
        action: LogAction,
        message: impl Into<String>,
        error: &str,
    ) -> Result<()> {
        self.append(instance, action, LogStatus::Failure, &message.into(), Some(error))
            .await
    }

    pub async fn append(
        &self,
        instance: &Instance,
        action: LogAction,
        status: LogStatus,
        message: &str,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO deployment_logs (instance_id, user_id, action, status, message, error) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&instance.id)
        .bind(&instance.user_id)
        .bind(action.as_str())
        .bind(status.as_str())
        .bind(message)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("failed to append deployment log")?;

        Ok(())
    }

    /// Entries for one instance, oldest first.
    pub async fn list_for_instance(&self, instance_id: &str, limit: i64) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            "SELECT id, instance_id, user_id, action, status, message, error, created_at FROM ( \
                SELECT * FROM deployment_logs WHERE instance_id = ? ORDER BY id DESC LIMIT ? \
             ) ORDER BY id ASC",
        )
        .bind(instance_id)
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await
        .context("failed to list deployment logs")?;

        rows.into_iter().map(entry_from_row).collect()
    }

    /// Entries across every instance a user has had, oldest first.
    pub async fn list_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            "SELECT id, instance_id, user_id, action, status, message, error, created_at FROM ( \
                SELECT * FROM deployment_logs WHERE user_id = ? ORDER BY id DESC LIMIT ? \
             ) ORDER BY id ASC",
        )
        .bind(user_id)
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await
        .context("failed to list deployment logs for user")?;

        rows.into_iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: sqlx::sqlite::SqliteRow) -> Result<LogEntry> {
    let action_value: String = row.try_get("action").context("failed to read log action")?;
    let status_value: String = row.try_get("status").context("failed to read log status")?;

    Ok(LogEntry {
        id: row.try_get("id").context("failed to read log id")?,
        instance_id: row
            .try_get("instance_id")
            .context("failed to read log instance_id")?,
        user_id: row.try_get("user_id").context("failed to read log user_id")?,
        action: LogAction::parse(&action_value)
            .with_context(|| format!("invalid log action in database: {action_value}"))?,
        status: LogStatus::parse(&status_value)
            .with_context(|| format!("invalid log status in database: {status_value}"))?,
        message: row.try_get("message").context("failed to read log message")?,
        error: row.try_get::<Option<String>, _>("error").ok().flatten(),
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|value| value.and_utc())
            .context("failed to read log created_at")?,
    })
}
