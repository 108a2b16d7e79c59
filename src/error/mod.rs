use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Stage execution not found: {execution_id}")]
    StageExecutionNotFound { execution_id: String },

    #[error("Chat not found: {chat_id}")]
    ChatNotFound { chat_id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// LLM call errors
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LlmError {
    /// Whether a retry of the same request may succeed.
    ///
    /// Timeouts, connection failures and HTTP 408/429/5xx are transient.
    /// `Unavailable` is what remains after retries ran out, so it is final.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout { .. } | LlmError::Connection { .. } => true,
            LlmError::Api { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            LlmError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::Unavailable { .. } | LlmError::InvalidResponse { .. } => false,
        }
    }
}

/// Tool server errors
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool server '{server}' is not configured")]
    ServerNotConfigured { server: String },

    #[error("Failed to start tool server '{server}': {message}")]
    Spawn { server: String, message: String },

    #[error("Tool server '{server}' protocol error: {message}")]
    Protocol { server: String, message: String },

    #[error("Tool '{tool}' not found on server '{server}'")]
    ToolNotFound { server: String, tool: String },

    #[error("Tool '{tool}' on server '{server}' failed: {message}")]
    Execution {
        server: String,
        tool: String,
        message: String,
    },

    #[error("Tool server '{server}' connection closed")]
    Closed { server: String },

    #[error("Tool server '{server}' did not respond within {timeout_ms}ms")]
    Timeout { server: String, timeout_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Execution engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Cooperative cancellation observed at a suspension point.
    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Stage execution not found: {execution_id}")]
    StageExecutionNotFound { execution_id: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Duplicate alert already in flight (fingerprint {fingerprint})")]
    DuplicateAlert { fingerprint: String },

    #[error("Invalid chain definition: {message}")]
    InvalidChain { message: String },

    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    /// Shorthand for a user-initiated cancellation.
    pub fn cancelled_by_user() -> Self {
        EngineError::Cancelled {
            reason: crate::CANCELLED_BY_USER.to_string(),
        }
    }

    /// Whether this error is a cancellation signal rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled { .. })
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// Result type alias for tool server operations
pub type ToolResult<T> = Result<T, ToolError>;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
