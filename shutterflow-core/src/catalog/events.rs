use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::Result;

/// Severity of an audit event. Mirrors the tracing levels the stages log
/// at, but persisted alongside the state they describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "INFO",
            EventLevel::Warning => "WARNING",
            EventLevel::Error => "ERROR",
        }
    }
}

/// One append-only audit row. `context` is the raw JSON payload recorded
/// with the event, if any.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EventRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub module: String,
    pub level: EventLevel,
    pub message: String,
    pub context: Option<String>,
}

/// Append-only event log. Events are never updated or deleted; they are
/// the audit trail for every state transition the stages perform.
#[derive(Debug, Clone)]
pub struct EventLog {
    pool: SqlitePool,
}

impl EventLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        module: &str,
        level: EventLevel,
        message: &str,
        context: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (ts, module, level, message, context)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(Utc::now())
        .bind(module)
        .bind(level)
        .bind(message)
        .bind(context.map(|value| value.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent events first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<EventRecord>> {
        let records = sqlx::query_as::<_, EventRecord>(
            "SELECT * FROM events ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
