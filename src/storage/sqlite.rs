use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use super::{
    Chat, ChatMessage, Page, Paged, Session, SessionFilter, StageExecution, Storage,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::history::{Interaction, InteractionDetails};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory instance (tests and dry runs).
    ///
    /// An in-memory database lives only as long as its connection, so the
    /// pool is pinned to a single connection that is never recycled.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    async fn create_session(&self, session: &Session) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, alert_type, alert, alert_fingerprint, chain_id, chain, status,
                error_message, final_analysis, executive_summary, pause_metadata,
                input_tokens, output_tokens, total_tokens,
                created_at, started_at, completed_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.alert.alert_type)
        .bind(serde_json::to_string(&session.alert)?)
        .bind(&session.alert_fingerprint)
        .bind(&session.chain.chain_id)
        .bind(serde_json::to_string(&session.chain)?)
        .bind(session.status.as_str())
        .bind(&session.error_message)
        .bind(&session.final_analysis)
        .bind(&session.executive_summary)
        .bind(to_json_opt(&session.pause_metadata)?)
        .bind(session.input_tokens)
        .bind(session.output_tokens)
        .bind(session.total_tokens)
        .bind(ts(&session.created_at))
        .bind(session.started_at.as_ref().map(ts))
        .bind(session.completed_at.as_ref().map(ts))
        .bind(ts(&session.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, alert, alert_fingerprint, chain, status, error_message,
                   final_analysis, executive_summary, pause_metadata,
                   input_tokens, output_tokens, total_tokens,
                   created_at, started_at, completed_at, updated_at
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Session::try_from).transpose()
    }

    async fn update_session(&self, session: &Session) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = ?, error_message = ?, final_analysis = ?, executive_summary = ?,
                pause_metadata = ?, started_at = ?, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(session.status.as_str())
        .bind(&session.error_message)
        .bind(&session.final_analysis)
        .bind(&session.executive_summary)
        .bind(to_json_opt(&session.pause_metadata)?)
        .bind(session.started_at.as_ref().map(ts))
        .bind(session.completed_at.as_ref().map(ts))
        .bind(ts(&session.updated_at))
        .bind(&session.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SessionNotFound {
                session_id: session.id.clone(),
            });
        }

        Ok(())
    }

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
        page: Page,
    ) -> StorageResult<Paged<Session>> {
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions WHERE (? IS NULL OR status = ?)",
        )
        .bind(status)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, alert, alert_fingerprint, chain, status, error_message,
                   final_analysis, executive_summary, pause_metadata,
                   input_tokens, output_tokens, total_tokens,
                   created_at, started_at, completed_at, updated_at
            FROM sessions
            WHERE (? IS NULL OR status = ?)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(status)
        .bind(status)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(Session::try_from)
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(Paged { items, total })
    }

    // ------------------------------------------------------------------
    // Stage executions
    // ------------------------------------------------------------------

    async fn create_stage_execution(&self, execution: &StageExecution) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stage_executions (
                execution_id, session_id, stage_index, parallel_index, stage_name, agent, kind,
                parent_execution_id, parallel_type, success_policy, iteration_strategy, chat_id,
                status, current_iteration, started_at, paused_at, completed_at, error_message,
                stage_output, pause_metadata, conversation,
                input_tokens, output_tokens, total_tokens, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.execution_id)
        .bind(&execution.session_id)
        .bind(execution.stage_index)
        .bind(execution.parallel_index)
        .bind(&execution.stage_name)
        .bind(&execution.agent)
        .bind(execution.kind.as_str())
        .bind(&execution.parent_execution_id)
        .bind(execution.parallel_type.map(|t| t.as_str()))
        .bind(execution.success_policy.map(|p| p.as_str()))
        .bind(execution.iteration_strategy.map(|s| s.as_str()))
        .bind(&execution.chat_id)
        .bind(execution.status.as_str())
        .bind(i64::from(execution.current_iteration))
        .bind(execution.started_at.as_ref().map(ts))
        .bind(execution.paused_at.as_ref().map(ts))
        .bind(execution.completed_at.as_ref().map(ts))
        .bind(&execution.error_message)
        .bind(&execution.stage_output)
        .bind(to_json_opt(&execution.pause_metadata)?)
        .bind(to_json_opt(&execution.conversation)?)
        .bind(execution.input_tokens)
        .bind(execution.output_tokens)
        .bind(execution.total_tokens)
        .bind(ts(&execution.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_stage_execution(&self, id: &str) -> StorageResult<Option<StageExecution>> {
        let row: Option<StageExecutionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM stage_executions WHERE execution_id = ?",
            STAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StageExecution::try_from).transpose()
    }

    async fn update_stage_execution(&self, execution: &StageExecution) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE stage_executions
            SET status = ?, current_iteration = ?, started_at = ?, paused_at = ?,
                completed_at = ?, error_message = ?, stage_output = ?,
                pause_metadata = ?, conversation = ?
            WHERE execution_id = ?
            "#,
        )
        .bind(execution.status.as_str())
        .bind(i64::from(execution.current_iteration))
        .bind(execution.started_at.as_ref().map(ts))
        .bind(execution.paused_at.as_ref().map(ts))
        .bind(execution.completed_at.as_ref().map(ts))
        .bind(&execution.error_message)
        .bind(&execution.stage_output)
        .bind(to_json_opt(&execution.pause_metadata)?)
        .bind(to_json_opt(&execution.conversation)?)
        .bind(&execution.execution_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::StageExecutionNotFound {
                execution_id: execution.execution_id.clone(),
            });
        }

        Ok(())
    }

    async fn set_stage_iteration(&self, id: &str, iteration: u32) -> StorageResult<()> {
        let result =
            sqlx::query("UPDATE stage_executions SET current_iteration = ? WHERE execution_id = ?")
                .bind(i64::from(iteration))
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::StageExecutionNotFound {
                execution_id: id.to_string(),
            });
        }

        Ok(())
    }

    async fn get_session_stage_executions(
        &self,
        session_id: &str,
    ) -> StorageResult<Vec<StageExecution>> {
        let rows: Vec<StageExecutionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM stage_executions WHERE session_id = ? \
             ORDER BY stage_index ASC, parallel_index ASC, created_at ASC",
            STAGE_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StageExecution::try_from).collect()
    }

    async fn get_child_executions(&self, parent_id: &str) -> StorageResult<Vec<StageExecution>> {
        let rows: Vec<StageExecutionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM stage_executions WHERE parent_execution_id = ? \
             ORDER BY parallel_index ASC",
            STAGE_COLUMNS
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StageExecution::try_from).collect()
    }

    // ------------------------------------------------------------------
    // Interactions
    // ------------------------------------------------------------------

    async fn append_interaction(&self, interaction: &Interaction) -> StorageResult<()> {
        let usage = interaction.usage();
        let (kind, interaction_type) = match &interaction.details {
            InteractionDetails::Llm(llm) => ("llm", Some(llm.interaction_type.as_str())),
            InteractionDetails::Tool(_) => ("tool", None),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO interactions (
                id, session_id, stage_execution_id, sequence, kind, interaction_type, success,
                input_tokens, output_tokens, total_tokens, duration_ms, details, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&interaction.id)
        .bind(&interaction.session_id)
        .bind(&interaction.stage_execution_id)
        .bind(interaction.sequence)
        .bind(kind)
        .bind(interaction_type)
        .bind(interaction.success())
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(usage.total_tokens)
        .bind(interaction.duration_ms)
        .bind(serde_json::to_string(&interaction.details)?)
        .bind(ts(&interaction.created_at))
        .execute(&mut *tx)
        .await?;

        if usage.total_tokens != 0 || usage.input_tokens != 0 || usage.output_tokens != 0 {
            if let Some(execution_id) = &interaction.stage_execution_id {
                sqlx::query(
                    r#"
                    UPDATE stage_executions
                    SET input_tokens = input_tokens + ?, output_tokens = output_tokens + ?,
                        total_tokens = total_tokens + ?
                    WHERE execution_id = ?
                    "#,
                )
                .bind(usage.input_tokens)
                .bind(usage.output_tokens)
                .bind(usage.total_tokens)
                .bind(execution_id)
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query(
                r#"
                UPDATE sessions
                SET input_tokens = input_tokens + ?, output_tokens = output_tokens + ?,
                    total_tokens = total_tokens + ?
                WHERE id = ?
                "#,
            )
            .bind(usage.input_tokens)
            .bind(usage.output_tokens)
            .bind(usage.total_tokens)
            .bind(&interaction.session_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn get_stage_interactions(&self, execution_id: &str) -> StorageResult<Vec<Interaction>> {
        let rows: Vec<InteractionRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, stage_execution_id, sequence, duration_ms, details, created_at
            FROM interactions
            WHERE stage_execution_id = ?
            ORDER BY sequence ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Interaction::try_from).collect()
    }

    async fn get_last_interaction(
        &self,
        session_id: &str,
        execution_id: Option<&str>,
    ) -> StorageResult<Option<Interaction>> {
        let row: Option<InteractionRow> = match execution_id {
            Some(execution_id) => {
                sqlx::query_as(
                    r#"
                    SELECT id, session_id, stage_execution_id, sequence, duration_ms, details, created_at
                    FROM interactions
                    WHERE stage_execution_id = ?
                    ORDER BY sequence DESC
                    LIMIT 1
                    "#,
                )
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, session_id, stage_execution_id, sequence, duration_ms, details, created_at
                    FROM interactions
                    WHERE session_id = ? AND stage_execution_id IS NULL
                    ORDER BY sequence DESC
                    LIMIT 1
                    "#,
                )
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.map(Interaction::try_from).transpose()
    }

    async fn get_session_interactions(
        &self,
        session_id: &str,
        page: Page,
    ) -> StorageResult<Paged<Interaction>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM interactions WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;

        let rows: Vec<InteractionRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, stage_execution_id, sequence, duration_ms, details, created_at
            FROM interactions
            WHERE session_id = ?
            ORDER BY created_at ASC, sequence ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(session_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(Interaction::try_from)
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(Paged { items, total })
    }

    // ------------------------------------------------------------------
    // Chats
    // ------------------------------------------------------------------

    async fn create_chat(&self, chat: &Chat) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chats (chat_id, session_id, created_by, context_snapshot, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chat.chat_id)
        .bind(&chat.session_id)
        .bind(&chat.created_by)
        .bind(&chat.context_snapshot)
        .bind(ts(&chat.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_chat(&self, id: &str) -> StorageResult<Option<Chat>> {
        let row: Option<ChatRow> = sqlx::query_as(
            r#"
            SELECT chat_id, session_id, created_by, context_snapshot, created_at
            FROM chats
            WHERE chat_id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn get_session_chats(&self, session_id: &str) -> StorageResult<Vec<Chat>> {
        let rows: Vec<ChatRow> = sqlx::query_as(
            r#"
            SELECT chat_id, session_id, created_by, context_snapshot, created_at
            FROM chats
            WHERE session_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn append_chat_message(&self, message: &ChatMessage) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_messages (
                message_id, chat_id, role, author, content, stage_execution_id, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.chat_id)
        .bind(message.role.to_string())
        .bind(&message.author)
        .bind(&message.content)
        .bind(&message.stage_execution_id)
        .bind(ts(&message.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_chat_messages(
        &self,
        chat_id: &str,
        page: Page,
    ) -> StorageResult<Paged<ChatMessage>> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages WHERE chat_id = ?")
                .bind(chat_id)
                .fetch_one(&self.pool)
                .await?;

        let rows: Vec<ChatMessageRow> = sqlx::query_as(
            r#"
            SELECT message_id, chat_id, role, author, content, stage_execution_id, created_at
            FROM chat_messages
            WHERE chat_id = ?
            ORDER BY created_at ASC, rowid ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(chat_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(ChatMessage::try_from)
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(Paged { items, total })
    }
}

// ============================================================================
// Encoding helpers
// ============================================================================

const STAGE_COLUMNS: &str = "execution_id, session_id, stage_index, parallel_index, stage_name, \
    agent, kind, parent_execution_id, parallel_type, success_policy, iteration_strategy, chat_id, \
    status, current_iteration, started_at, paused_at, completed_at, error_message, stage_output, \
    pause_metadata, conversation, input_tokens, output_tokens, total_tokens, created_at";

/// Fixed-width RFC3339 so that text ordering equals chronological ordering.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().map(parse_ts)
}

fn to_json_opt<T: serde::Serialize>(value: &Option<T>) -> StorageResult<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StorageError::from)
}

fn from_json_opt<T: serde::de::DeserializeOwned>(raw: Option<String>) -> StorageResult<Option<T>> {
    raw.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(StorageError::from)
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> StorageResult<T> {
    raw.parse().map_err(|message| StorageError::Query { message })
}

fn parse_enum_opt<T: FromStr<Err = String>>(raw: Option<String>) -> StorageResult<Option<T>> {
    raw.as_deref().map(parse_enum).transpose()
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    alert: String,
    alert_fingerprint: String,
    chain: String,
    status: String,
    error_message: Option<String>,
    final_analysis: Option<String>,
    executive_summary: Option<String>,
    pause_metadata: Option<String>,
    input_tokens: i64,
    output_tokens: i64,
    total_tokens: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
}

impl TryFrom<SessionRow> for Session {
    type Error = StorageError;

    fn try_from(row: SessionRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            alert: serde_json::from_str(&row.alert)?,
            alert_fingerprint: row.alert_fingerprint,
            chain: serde_json::from_str(&row.chain)?,
            status: parse_enum(&row.status)?,
            error_message: row.error_message,
            final_analysis: row.final_analysis,
            executive_summary: row.executive_summary,
            pause_metadata: from_json_opt(row.pause_metadata)?,
            input_tokens: row.input_tokens,
            output_tokens: row.output_tokens,
            total_tokens: row.total_tokens,
            created_at: parse_ts(&row.created_at),
            started_at: parse_ts_opt(row.started_at),
            completed_at: parse_ts_opt(row.completed_at),
            updated_at: parse_ts(&row.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct StageExecutionRow {
    execution_id: String,
    session_id: String,
    stage_index: i64,
    parallel_index: i64,
    stage_name: String,
    agent: String,
    kind: String,
    parent_execution_id: Option<String>,
    parallel_type: Option<String>,
    success_policy: Option<String>,
    iteration_strategy: Option<String>,
    chat_id: Option<String>,
    status: String,
    current_iteration: i64,
    started_at: Option<String>,
    paused_at: Option<String>,
    completed_at: Option<String>,
    error_message: Option<String>,
    stage_output: Option<String>,
    pause_metadata: Option<String>,
    conversation: Option<String>,
    input_tokens: i64,
    output_tokens: i64,
    total_tokens: i64,
    created_at: String,
}

impl TryFrom<StageExecutionRow> for StageExecution {
    type Error = StorageError;

    fn try_from(row: StageExecutionRow) -> StorageResult<Self> {
        Ok(Self {
            execution_id: row.execution_id,
            session_id: row.session_id,
            stage_index: row.stage_index,
            parallel_index: row.parallel_index,
            stage_name: row.stage_name,
            agent: row.agent,
            kind: parse_enum(&row.kind)?,
            parent_execution_id: row.parent_execution_id,
            parallel_type: parse_enum_opt(row.parallel_type)?,
            success_policy: parse_enum_opt(row.success_policy)?,
            iteration_strategy: parse_enum_opt(row.iteration_strategy)?,
            chat_id: row.chat_id,
            status: parse_enum(&row.status)?,
            current_iteration: u32::try_from(row.current_iteration).unwrap_or(0),
            started_at: parse_ts_opt(row.started_at),
            paused_at: parse_ts_opt(row.paused_at),
            completed_at: parse_ts_opt(row.completed_at),
            error_message: row.error_message,
            stage_output: row.stage_output,
            pause_metadata: from_json_opt(row.pause_metadata)?,
            conversation: from_json_opt(row.conversation)?,
            input_tokens: row.input_tokens,
            output_tokens: row.output_tokens,
            total_tokens: row.total_tokens,
            created_at: parse_ts(&row.created_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct InteractionRow {
    id: String,
    session_id: String,
    stage_execution_id: Option<String>,
    sequence: i64,
    duration_ms: i64,
    details: String,
    created_at: String,
}

impl TryFrom<InteractionRow> for Interaction {
    type Error = StorageError;

    fn try_from(row: InteractionRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            stage_execution_id: row.stage_execution_id,
            sequence: row.sequence,
            created_at: parse_ts(&row.created_at),
            duration_ms: row.duration_ms,
            details: serde_json::from_str(&row.details)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ChatRow {
    chat_id: String,
    session_id: String,
    created_by: String,
    context_snapshot: String,
    created_at: String,
}

impl From<ChatRow> for Chat {
    fn from(row: ChatRow) -> Self {
        Self {
            chat_id: row.chat_id,
            session_id: row.session_id,
            created_by: row.created_by,
            context_snapshot: row.context_snapshot,
            created_at: parse_ts(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ChatMessageRow {
    message_id: String,
    chat_id: String,
    role: String,
    author: String,
    content: String,
    stage_execution_id: Option<String>,
    created_at: String,
}

impl TryFrom<ChatMessageRow> for ChatMessage {
    type Error = StorageError;

    fn try_from(row: ChatMessageRow) -> StorageResult<Self> {
        Ok(Self {
            message_id: row.message_id,
            chat_id: row.chat_id,
            role: parse_enum(&row.role)?,
            author: row.author,
            content: row.content,
            stage_execution_id: row.stage_execution_id,
            created_at: parse_ts(&row.created_at),
        })
    }
}
