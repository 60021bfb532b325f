use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::bus::enhanced::EnhancedMessage;
use crate::error::Result;

/// A message row read back from the durable log.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: String,
    pub from_agent: String,
    pub to_agent: Option<String>,
    pub message_type: String,
    pub content: serde_json::Value,
    pub priority: String,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub status: String,
    pub conversation_id: Option<String>,
    pub workflow_id: Option<String>,
    pub retry_count: i64,
    pub ttl_seconds: Option<i64>,
}

/// A workflow row read back from the durable log.
#[derive(Debug, Clone)]
pub struct StoredWorkflow {
    pub workflow_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: serde_json::Value,
}

/// Relational log of persistent messages, advertised capabilities and
/// workflows, for replay and audit. SQLite-backed; the log is local to the
/// controller process.
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    /// Open (and create if needed) the store at `url`, e.g.
    /// `sqlite:swarmbus.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!("message store ready at {}", url);
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                from_agent TEXT NOT NULL,
                to_agent TEXT,
                message_type TEXT NOT NULL,
                content TEXT NOT NULL,
                priority TEXT NOT NULL,
                created_at TEXT NOT NULL,
                delivered_at TEXT,
                acknowledged_at TEXT,
                status TEXT NOT NULL,
                conversation_id TEXT,
                workflow_id TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                ttl_seconds INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_capabilities (
                agent_name TEXT NOT NULL,
                capability TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 1.0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (agent_name, capability)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS workflows (
                workflow_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                steps TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert (or refresh) a persistent message.
    pub async fn record_message(&self, record: &EnhancedMessage) -> Result<()> {
        let content = serde_json::to_string(&record.message.content)?;
        sqlx::query(
            "INSERT OR REPLACE INTO messages (
                message_id, from_agent, to_agent, message_type, content,
                priority, created_at, delivered_at, acknowledged_at, status,
                conversation_id, workflow_id, retry_count, ttl_seconds
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.message_id.to_string())
        .bind(&record.message.from)
        .bind(record.message.to.as_deref())
        .bind(record.message.kind())
        .bind(content)
        .bind(record.message.priority.to_string())
        .bind(record.message.timestamp)
        .bind(record.metrics.delivered_at)
        .bind(record.metrics.acked_at)
        .bind(record.delivery_status.as_str())
        .bind(record.conversation_id.map(|id| id.to_string()))
        .bind(record.workflow_id.map(|id| id.to_string()))
        .bind(record.metrics.retry_count as i64)
        .bind(record.message.ttl_secs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh the lifecycle columns of an already-recorded message.
    pub async fn update_message_status(&self, record: &EnhancedMessage) -> Result<()> {
        sqlx::query(
            "UPDATE messages
             SET status = ?, delivered_at = ?, acknowledged_at = ?, retry_count = ?
             WHERE message_id = ?",
        )
        .bind(record.delivery_status.as_str())
        .bind(record.metrics.delivered_at)
        .bind(record.metrics.acked_at)
        .bind(record.metrics.retry_count as i64)
        .bind(record.message_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert one advertised capability.
    pub async fn record_capability(
        &self,
        agent_name: &str,
        capability: &str,
        confidence: f64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_capabilities (agent_name, capability, confidence, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (agent_name, capability)
             DO UPDATE SET confidence = excluded.confidence, updated_at = excluded.updated_at",
        )
        .bind(agent_name)
        .bind(capability)
        .bind(confidence)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_workflow(
        &self,
        workflow_id: Uuid,
        status: &str,
        steps: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO workflows (workflow_id, status, created_at, completed_at, steps)
             VALUES (?, ?, ?, NULL, ?)",
        )
        .bind(workflow_id.to_string())
        .bind(status)
        .bind(Utc::now())
        .bind(steps.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete_workflow(&self, workflow_id: Uuid, status: &str) -> Result<()> {
        sqlx::query(
            "UPDATE workflows SET status = ?, completed_at = ? WHERE workflow_id = ?",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(workflow_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Messages that never reached a terminal acknowledged state.
    pub async fn undelivered_messages(&self) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE status IN ('pending', 'failed') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    /// Full message trail of one conversation, oldest first.
    pub async fn conversation(&self, conversation_id: Uuid) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    pub async fn workflow(&self, workflow_id: Uuid) -> Result<Option<StoredWorkflow>> {
        let row = sqlx::query("SELECT * FROM workflows WHERE workflow_id = ?")
            .bind(workflow_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(StoredWorkflow {
                workflow_id: row.try_get("workflow_id")?,
                status: row.try_get("status")?,
                created_at: row.try_get("created_at")?,
                completed_at: row.try_get("completed_at")?,
                steps: parse_json(row.try_get::<String, _>("steps")?),
            })),
            None => Ok(None),
        }
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage> {
    Ok(StoredMessage {
        message_id: row.try_get("message_id")?,
        from_agent: row.try_get("from_agent")?,
        to_agent: row.try_get("to_agent")?,
        message_type: row.try_get("message_type")?,
        content: parse_json(row.try_get::<String, _>("content")?),
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
        delivered_at: row.try_get("delivered_at")?,
        acknowledged_at: row.try_get("acknowledged_at")?,
        status: row.try_get("status")?,
        conversation_id: row.try_get("conversation_id")?,
        workflow_id: row.try_get("workflow_id")?,
        retry_count: row.try_get("retry_count")?,
        ttl_seconds: row.try_get("ttl_seconds")?,
    })
}

fn parse_json(raw: String) -> serde_json::Value {
    serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null)
}
