//! Persistent Queue Store (§4.1): durable storage and atomic state
//! transitions for queued messages and responses.

use crate::error::{QueueError, Result};
use crate::events::{Event, EventBus};
use anyhow::Context as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row as _, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

/// Status of a queued message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Dead,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Completed => "completed",
            MessageStatus::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MessageStatus::Pending),
            "processing" => Some(MessageStatus::Processing),
            "completed" => Some(MessageStatus::Completed),
            "dead" => Some(MessageStatus::Dead),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A queued message row (§3 Queued Message).
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: i64,
    pub message_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: String,
    pub text: String,
    pub target_agent: Option<String>,
    pub files: Vec<String>,
    pub conversation_id: Option<String>,
    pub from_agent: Option<String>,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub claimer: Option<String>,
}

/// Status of a queued response row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Pending,
    Acked,
}

impl ResponseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseStatus::Pending => "pending",
            ResponseStatus::Acked => "acked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ResponseStatus::Pending),
            "acked" => Some(ResponseStatus::Acked),
            _ => None,
        }
    }
}

/// A queued response row (§3 Queued Response).
#[derive(Debug, Clone)]
pub struct QueuedResponse {
    pub id: i64,
    pub message_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: String,
    pub text: String,
    pub original_text: String,
    pub agent: String,
    pub files: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub status: ResponseStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub acked_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Input for enqueueing a new message.
#[derive(Debug, Clone)]
pub struct EnqueueMessageInput {
    pub message_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: String,
    pub text: String,
    pub target_agent: Option<String>,
    pub files: Vec<String>,
    pub conversation_id: Option<String>,
    pub from_agent: Option<String>,
}

/// Input for enqueueing a new response.
#[derive(Debug, Clone)]
pub struct EnqueueResponseInput {
    pub message_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: String,
    pub text: String,
    pub original_text: String,
    pub agent: String,
    pub files: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A status-grouped count snapshot (§6 `GET /api/queue/status`).
#[derive(Debug, Clone, Default)]
pub struct QueueStatus {
    pub incoming: i64,
    pub processing: i64,
    pub completed: i64,
    pub dead: i64,
    pub outgoing: i64,
}

/// Durable queue store over a `SqlitePool`.
#[derive(Debug, Clone)]
pub struct QueueStore {
    pool: SqlitePool,
    events: EventBus,
}

impl QueueStore {
    /// Open (and migrate) the store at `path`. WAL mode and a generous busy
    /// timeout let multiple in-process callers share the connection pool.
    /// `events` is the process-wide bus: the store emits `message_received`/
    /// `message_enqueued` on every successful enqueue (§4.7), whether the
    /// caller is an external adapter or the dispatcher's own internal
    /// follow-up fan-out.
    pub async fn open(path: &std::path::Path, events: EventBus) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .context("invalid sqlite path")?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(10))
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("failed to open queue store")?;

        let store = Self { pool, events };
        store.initialize().await?;
        Ok(store)
    }

    #[cfg(test)]
    async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("in-memory sqlite should connect")?;
        let store = Self { pool, events: EventBus::new() };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                channel TEXT NOT NULL,
                sender TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                text TEXT NOT NULL,
                target_agent TEXT,
                files TEXT NOT NULL DEFAULT '[]',
                conversation_id TEXT,
                from_agent TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                claimer TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create messages table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_status_target ON messages(status, target_agent)",
        )
        .execute(&self.pool)
        .await
        .context("failed to create messages index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS responses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                sender TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                text TEXT NOT NULL,
                original_text TEXT NOT NULL,
                agent TEXT NOT NULL,
                files TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                acked_at TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create responses table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_responses_channel_status ON responses(channel, status)")
            .execute(&self.pool)
            .await
            .context("failed to create responses index")?;

        Ok(())
    }

    /// Enqueue message. Fails with `DuplicateId` if `message_id` already exists.
    pub async fn enqueue_message(&self, input: EnqueueMessageInput) -> Result<QueuedMessage> {
        let files_json = serde_json::to_string(&input.files).context("failed to serialize files")?;

        let result = sqlx::query(
            r#"
            INSERT INTO messages (
                message_id, channel, sender, sender_id, text, target_agent, files,
                conversation_id, from_agent
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&input.message_id)
        .bind(&input.channel)
        .bind(&input.sender)
        .bind(&input.sender_id)
        .bind(&input.text)
        .bind(&input.target_agent)
        .bind(&files_json)
        .bind(&input.conversation_id)
        .bind(&input.from_agent)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(ref db_error)) if is_unique_violation(db_error.as_ref()) => {
                return Err(QueueError::DuplicateId(input.message_id).into());
            }
            Err(error) => return Err(QueueError::Database(error).into()),
        }

        #[cfg(feature = "metrics")]
        crate::telemetry::Metrics::global()
            .messages_enqueued_total
            .with_label_values(&[&input.channel])
            .inc();

        let now = chrono::Utc::now();
        self.events.emit(Event::MessageReceived {
            channel: input.channel.clone(),
            message_id: input.message_id.clone(),
            timestamp: now,
        });
        self.events.emit(Event::MessageEnqueued {
            message_id: input.message_id.clone(),
            timestamp: now,
        });

        self.get_message_by_message_id(&input.message_id)
            .await?
            .context("message inserted but not found")
            .map_err(Into::into)
    }

    /// Atomically claim the oldest pending row targeting `agent_id`, or the
    /// oldest row with a null target when `agent_id == "default"`.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front so two concurrent
    /// claimers for the same agent cannot both select the same candidate row
    /// before either issues its UPDATE — a plain `tx.begin()` only issues
    /// `BEGIN DEFERRED`, which would let both readers proceed.
    pub async fn claim_next(&self, agent_id: &str) -> Result<Option<QueuedMessage>> {
        let mut tx = self.pool.begin().await.context("failed to open claim transaction")?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *tx)
            .await
            .context("failed to upgrade claim transaction lock")?;

        let candidate = if agent_id == "default" {
            sqlx::query("SELECT id FROM messages WHERE status = 'pending' AND target_agent IS NULL ORDER BY id ASC LIMIT 1")
                .fetch_optional(&mut *tx)
                .await
        } else {
            sqlx::query("SELECT id FROM messages WHERE status = 'pending' AND target_agent = ? ORDER BY id ASC LIMIT 1")
                .bind(agent_id)
                .fetch_optional(&mut *tx)
                .await
        }
        .context("failed to select claim candidate")?;

        let Some(row) = candidate else {
            tx.commit().await.ok();
            return Ok(None);
        };

        let id: i64 = row.try_get("id").context("failed to read candidate id")?;

        let updated = sqlx::query(
            "UPDATE messages SET status = 'processing', claimer = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ? AND status = 'pending'",
        )
        .bind(agent_id)
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed to claim message")?;

        if updated.rows_affected() == 0 {
            tx.commit().await.ok();
            return Ok(None);
        }

        let row = sqlx::query(MESSAGE_COLUMNS)
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .context("failed to reload claimed message")?;

        tx.commit().await.context("failed to commit claim transaction")?;

        #[cfg(feature = "metrics")]
        crate::telemetry::Metrics::global()
            .messages_claimed_total
            .with_label_values(&[agent_id])
            .inc();

        Ok(Some(message_from_row(row)?))
    }

    /// Complete message: mark it completed.
    pub async fn complete_message(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE messages SET status = 'completed', updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to complete message")?;
        Ok(())
    }

    /// Fail message with error `e`: increment retry_count, dead-letter at
    /// `max_retries`, otherwise return to pending. Returns whether the row
    /// was dead-lettered by this call.
    pub async fn fail_message(&self, id: i64, error: &str, max_retries: u32) -> Result<bool> {
        let row = sqlx::query("SELECT retry_count FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read retry count")?;
        let Some(row) = row else {
            return Err(QueueError::MessageNotFound(id).into());
        };
        let retry_count: i64 = row.try_get("retry_count").context("failed to read retry_count")?;
        let next_count = retry_count + 1;
        let now_dead = next_count as u32 >= max_retries;

        if now_dead {
            sqlx::query(
                "UPDATE messages SET status = 'dead', retry_count = ?, last_error = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            )
            .bind(next_count)
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to dead-letter message")?;
        } else {
            sqlx::query(
                "UPDATE messages SET status = 'pending', claimer = NULL, retry_count = ?, last_error = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            )
            .bind(next_count)
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to requeue message")?;
        }

        Ok(now_dead)
    }

    /// Enqueue a response row in status=pending. Returns the surrogate id.
    pub async fn enqueue_response(&self, input: EnqueueResponseInput) -> Result<i64> {
        let files_json = serde_json::to_string(&input.files).context("failed to serialize files")?;
        let metadata_json =
            serde_json::to_string(&input.metadata).context("failed to serialize metadata")?;

        let result = sqlx::query(
            r#"
            INSERT INTO responses (
                message_id, channel, sender, sender_id, text, original_text, agent, files, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&input.message_id)
        .bind(&input.channel)
        .bind(&input.sender)
        .bind(&input.sender_id)
        .bind(&input.text)
        .bind(&input.original_text)
        .bind(&input.agent)
        .bind(&files_json)
        .bind(&metadata_json)
        .execute(&self.pool)
        .await
        .context("failed to enqueue response")?;

        Ok(result.last_insert_rowid())
    }

    /// List pending responses for channel C, oldest first.
    pub async fn list_pending_responses(&self, channel: &str) -> Result<Vec<QueuedResponse>> {
        let rows = sqlx::query(&format!(
            "{RESPONSE_COLUMNS} WHERE channel = ? AND status = 'pending' ORDER BY id ASC"
        ))
        .bind(channel)
        .fetch_all(&self.pool)
        .await
        .context("failed to list pending responses")?;

        rows.into_iter().map(response_from_row).collect()
    }

    /// Ack response by id. No-op if already acked.
    pub async fn ack_response(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE responses SET status = 'acked', acked_at = CURRENT_TIMESTAMP WHERE id = ? AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to ack response")?;

        if result.rows_affected() == 0 {
            // Either already acked (no-op, per contract) or the id does not exist.
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM responses WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("failed to check response existence")?;
            if exists.is_none() {
                return Err(QueueError::ResponseNotFound(id).into());
            }
        }

        Ok(())
    }

    /// Most recent N responses by created_at, for observability.
    pub async fn recent_responses(&self, limit: i64) -> Result<Vec<QueuedResponse>> {
        let rows = sqlx::query(&format!(
            "{RESPONSE_COLUMNS} ORDER BY id DESC LIMIT ?"
        ))
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await
        .context("failed to list recent responses")?;

        rows.into_iter().map(response_from_row).collect()
    }

    /// Queue status snapshot: counts grouped by status, plus pending responses.
    pub async fn status(&self) -> Result<QueueStatus> {
        let mut status = QueueStatus::default();
        let rows = sqlx::query("SELECT status, COUNT(*) as n FROM messages GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .context("failed to compute message status counts")?;
        for row in rows {
            let key: String = row.try_get("status").context("failed to read status")?;
            let count: i64 = row.try_get("n").context("failed to read count")?;
            match key.as_str() {
                "pending" => status.incoming = count,
                "processing" => status.processing = count,
                "completed" => status.completed = count,
                "dead" => status.dead = count,
                _ => {}
            }
        }

        status.outgoing = sqlx::query_scalar("SELECT COUNT(*) FROM responses WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await
            .context("failed to count pending responses")?;

        Ok(status)
    }

    /// List rows in status=dead.
    pub async fn list_dead(&self) -> Result<Vec<QueuedMessage>> {
        let rows = sqlx::query(&format!("{MESSAGE_COLUMNS_NO_WHERE} WHERE status = 'dead' ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await
            .context("failed to list dead messages")?;
        rows.into_iter().map(message_from_row).collect()
    }

    /// Retry flips a dead row back to pending with retry_count=0.
    pub async fn retry_dead(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'pending', claimer = NULL, retry_count = 0, last_error = NULL, updated_at = CURRENT_TIMESTAMP WHERE id = ? AND status = 'dead'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to retry dead message")?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotDead(id).into());
        }
        Ok(())
    }

    /// Delete one dead row.
    pub async fn delete_dead(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ? AND status = 'dead'")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete dead message")?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotDead(id).into());
        }
        Ok(())
    }

    /// Recover stale: processing rows whose updated_at is older than
    /// `threshold_secs` are forcibly reset to pending. Returns the number recovered.
    pub async fn recover_stale(&self, threshold_secs: u64) -> Result<u64> {
        let cutoff = chrono::Utc::now() - chrono::Duration::seconds(threshold_secs as i64);
        let result = sqlx::query(
            "UPDATE messages SET status = 'pending', claimer = NULL, updated_at = CURRENT_TIMESTAMP WHERE status = 'processing' AND updated_at < ?",
        )
        .bind(cutoff.naive_utc())
        .execute(&self.pool)
        .await
        .context("failed to recover stale claims")?;
        Ok(result.rows_affected())
    }

    /// Prune completed messages older than `retention_secs`.
    pub async fn prune_completed(&self, retention_secs: u64) -> Result<u64> {
        let cutoff = chrono::Utc::now() - chrono::Duration::seconds(retention_secs as i64);
        let result = sqlx::query("DELETE FROM messages WHERE status = 'completed' AND updated_at < ?")
            .bind(cutoff.naive_utc())
            .execute(&self.pool)
            .await
            .context("failed to prune completed messages")?;
        Ok(result.rows_affected())
    }

    /// Prune acked responses older than `retention_secs`.
    pub async fn prune_acked_responses(&self, retention_secs: u64) -> Result<u64> {
        let cutoff = chrono::Utc::now() - chrono::Duration::seconds(retention_secs as i64);
        let result = sqlx::query("DELETE FROM responses WHERE status = 'acked' AND acked_at < ?")
            .bind(cutoff.naive_utc())
            .execute(&self.pool)
            .await
            .context("failed to prune acked responses")?;
        Ok(result.rows_affected())
    }

    /// Distinct `COALESCE(target_agent, 'default')` over pending rows.
    pub async fn pending_agents(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT COALESCE(target_agent, 'default') as agent FROM messages WHERE status = 'pending'",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list pending agents")?;

        rows.into_iter()
            .map(|row| row.try_get("agent").context("failed to read agent").map_err(Into::into))
            .collect()
    }

    /// Pending message count grouped by target agent (`default` for a null
    /// target). Sampled by the maintenance loop into the pending-depth gauge.
    pub async fn pending_counts_by_agent(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT COALESCE(target_agent, 'default') as agent, COUNT(*) as n FROM messages WHERE status = 'pending' GROUP BY agent",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to count pending messages by agent")?;

        rows.into_iter()
            .map(|row| {
                let agent: String = row.try_get("agent").context("failed to read agent")?;
                let n: i64 = row.try_get("n").context("failed to read count")?;
                Ok((agent, n))
            })
            .collect()
    }

    async fn get_message_by_message_id(&self, message_id: &str) -> Result<Option<QueuedMessage>> {
        let row = sqlx::query(&format!("{MESSAGE_COLUMNS_NO_WHERE} WHERE message_id = ?"))
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch message by message_id")?;
        row.map(message_from_row).transpose()
    }
}

fn is_unique_violation(db_error: &dyn sqlx::error::DatabaseError) -> bool {
    db_error.code().as_deref() == Some("2067") || db_error.code().as_deref() == Some("1555")
}

const MESSAGE_COLUMNS_NO_WHERE: &str = "SELECT id, message_id, channel, sender, sender_id, text, target_agent, files, conversation_id, from_agent, status, retry_count, last_error, created_at, updated_at, claimer FROM messages";
const MESSAGE_COLUMNS: &str = "SELECT id, message_id, channel, sender, sender_id, text, target_agent, files, conversation_id, from_agent, status, retry_count, last_error, created_at, updated_at, claimer FROM messages WHERE id = ?";
const RESPONSE_COLUMNS: &str = "SELECT id, message_id, channel, sender, sender_id, text, original_text, agent, files, metadata, status, created_at, acked_at FROM responses";

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> Result<QueuedMessage> {
    let status_value: String = row.try_get("status").context("failed to read message status")?;
    let status = MessageStatus::parse(&status_value)
        .with_context(|| format!("invalid message status in database: {status_value}"))?;
    let files_value: String = row.try_get("files").unwrap_or_else(|_| "[]".to_string());
    let retry_count: i64 = row.try_get("retry_count").context("failed to read retry_count")?;

    Ok(QueuedMessage {
        id: row.try_get("id").context("failed to read id")?,
        message_id: row.try_get("message_id").context("failed to read message_id")?,
        channel: row.try_get("channel").context("failed to read channel")?,
        sender: row.try_get("sender").context("failed to read sender")?,
        sender_id: row.try_get("sender_id").context("failed to read sender_id")?,
        text: row.try_get("text").context("failed to read text")?,
        target_agent: row.try_get("target_agent").ok(),
        files: serde_json::from_str(&files_value).unwrap_or_default(),
        conversation_id: row.try_get("conversation_id").ok(),
        from_agent: row.try_get("from_agent").ok(),
        status,
        retry_count: retry_count as u32,
        last_error: row.try_get("last_error").ok(),
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|v| v.and_utc())
            .context("failed to read created_at")?,
        updated_at: row
            .try_get::<chrono::NaiveDateTime, _>("updated_at")
            .map(|v| v.and_utc())
            .context("failed to read updated_at")?,
        claimer: row.try_get("claimer").ok(),
    })
}

fn response_from_row(row: sqlx::sqlite::SqliteRow) -> Result<QueuedResponse> {
    let status_value: String = row.try_get("status").context("failed to read response status")?;
    let status = ResponseStatus::parse(&status_value)
        .with_context(|| format!("invalid response status in database: {status_value}"))?;
    let files_value: String = row.try_get("files").unwrap_or_else(|_| "[]".to_string());
    let metadata_value: String = row.try_get("metadata").unwrap_or_else(|_| "{}".to_string());

    Ok(QueuedResponse {
        id: row.try_get("id").context("failed to read id")?,
        message_id: row.try_get("message_id").context("failed to read message_id")?,
        channel: row.try_get("channel").context("failed to read channel")?,
        sender: row.try_get("sender").context("failed to read sender")?,
        sender_id: row.try_get("sender_id").context("failed to read sender_id")?,
        text: row.try_get("text").context("failed to read text")?,
        original_text: row.try_get("original_text").context("failed to read original_text")?,
        agent: row.try_get("agent").context("failed to read agent")?,
        files: serde_json::from_str(&files_value).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_value).unwrap_or_default(),
        status,
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|v| v.and_utc())
            .context("failed to read created_at")?,
        acked_at: row
            .try_get::<Option<chrono::NaiveDateTime>, _>("acked_at")
            .ok()
            .flatten()
            .map(|v| v.and_utc()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue_input(message_id: &str) -> EnqueueMessageInput {
        EnqueueMessageInput {
            message_id: message_id.to_string(),
            channel: "telegram".to_string(),
            sender: "Alice".to_string(),
            sender_id: "alice".to_string(),
            text: "ping".to_string(),
            target_agent: None,
            files: Vec::new(),
            conversation_id: None,
            from_agent: None,
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive_across_concurrent_callers() {
        let store = QueueStore::open_in_memory().await.unwrap();
        store.enqueue_message(enqueue_input("m1")).await.unwrap();

        let first = store.claim_next("default").await.unwrap();
        let second = store.claim_next("default").await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(first.unwrap().claimer.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn enqueue_emits_received_and_enqueued_events() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let mut rx = store.events.subscribe();

        store.enqueue_message(enqueue_input("m1")).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Event::MessageReceived { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, Event::MessageEnqueued { .. }));
    }

    #[tokio::test]
    async fn duplicate_message_id_is_rejected() {
        let store = QueueStore::open_in_memory().await.unwrap();
        store.enqueue_message(enqueue_input("m1")).await.unwrap();

        let error = store.enqueue_message(enqueue_input("m1")).await.unwrap_err();
        assert!(matches!(error, crate::Error::Queue(QueueError::DuplicateId(_))));
    }

    #[tokio::test]
    async fn fail_message_dead_letters_after_max_retries() {
        let store = QueueStore::open_in_memory().await.unwrap();
        store.enqueue_message(enqueue_input("m1")).await.unwrap();
        let claimed = store.claim_next("default").await.unwrap().unwrap();

        for _ in 0..4 {
            store.fail_message(claimed.id, "boom", 5).await.unwrap();
            store.claim_next("default").await.unwrap();
        }
        store.fail_message(claimed.id, "boom", 5).await.unwrap();

        let dead = store.list_dead().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 5);
    }

    #[tokio::test]
    async fn ack_response_is_idempotent() {
        let store = QueueStore::open_in_memory().await.unwrap();
        let id = store
            .enqueue_response(EnqueueResponseInput {
                message_id: "m1".to_string(),
                channel: "telegram".to_string(),
                sender: "Alice".to_string(),
                sender_id: "alice".to_string(),
                text: "pong".to_string(),
                original_text: "ping".to_string(),
                agent: "assistant".to_string(),
                files: Vec::new(),
                metadata: HashMap::new(),
            })
            .await
            .unwrap();

        store.ack_response(id).await.unwrap();
        let first_ack = store.recent_responses(1).await.unwrap()[0].acked_at;
        store.ack_response(id).await.unwrap();
        let second_ack = store.recent_responses(1).await.unwrap()[0].acked_at;

        assert_eq!(first_ack, second_ack);
    }

    #[tokio::test]
    async fn recover_stale_resets_old_processing_rows() {
        let store = QueueStore::open_in_memory().await.unwrap();
        store.enqueue_message(enqueue_input("m1")).await.unwrap();
        let claimed = store.claim_next("default").await.unwrap().unwrap();

        sqlx::query("UPDATE messages SET updated_at = datetime('now', '-20 minutes') WHERE id = ?")
            .bind(claimed.id)
            .execute(&store.pool)
            .await
            .unwrap();

        let recovered = store.recover_stale(600).await.unwrap();
        assert_eq!(recovered, 1);

        let reclaimed = store.claim_next("default").await.unwrap();
        assert!(reclaimed.is_some());
    }
}
