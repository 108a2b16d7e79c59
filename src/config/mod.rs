use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub engine: EngineConfig,
    pub tool_servers: HashMap<String, ToolServerSpec>,
}

/// LLM endpoint configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_output_tokens: Option<u32>,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request and retry configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    /// Retries after the first attempt, transient LLM failures only.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Defaults for agent runs and post-processing.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_iterations: u32,
    pub force_conclusion: bool,
    pub executive_summary_enabled: bool,
    pub summarization: SummarizationPolicy,
}

/// When an oversized tool result is replaced by an LLM summary.
#[derive(Debug, Clone, PartialEq)]
pub struct SummarizationPolicy {
    pub enabled: bool,
    /// Size above which a result is summarized, measured in `unit`.
    pub threshold: usize,
    pub unit: SizeUnit,
    pub summary_max_tokens: u32,
}

/// Unit used to measure tool result size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    /// Rough token estimate (four characters per token).
    Tokens,
    Chars,
}

/// How to launch one stdio tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let llm = LlmConfig {
            api_key: env::var("LLM_API_KEY").map_err(|_| AppError::Config {
                message: "LLM_API_KEY is required".to_string(),
            })?,
            base_url: env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            max_output_tokens: parse_var("LLM_MAX_OUTPUT_TOKENS"),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/incidents.db".to_string()),
            ),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS").unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: parse_var("REQUEST_TIMEOUT_MS").unwrap_or(120_000),
            max_retries: parse_var("MAX_RETRIES").unwrap_or(3),
            retry_delay_ms: parse_var("RETRY_DELAY_MS").unwrap_or(1000),
        };

        let summarization = SummarizationPolicy {
            enabled: parse_bool("SUMMARIZATION_ENABLED").unwrap_or(true),
            threshold: parse_var("SUMMARIZATION_THRESHOLD").unwrap_or(5000),
            unit: match env::var("SUMMARIZATION_UNIT")
                .unwrap_or_else(|_| "tokens".to_string())
                .to_lowercase()
                .as_str()
            {
                "chars" | "characters" => SizeUnit::Chars,
                _ => SizeUnit::Tokens,
            },
            summary_max_tokens: parse_var("SUMMARY_MAX_TOKENS").unwrap_or(1000),
        };

        let engine = EngineConfig {
            max_iterations: parse_var("MAX_ITERATIONS").unwrap_or(30),
            force_conclusion: parse_bool("FORCE_CONCLUSION").unwrap_or(false),
            executive_summary_enabled: parse_bool("EXECUTIVE_SUMMARY_ENABLED").unwrap_or(true),
            summarization,
        };

        let tool_servers = match env::var("TOOL_SERVERS") {
            Ok(raw) if !raw.trim().is_empty() => {
                serde_json::from_str(&raw).map_err(|e| AppError::Config {
                    message: format!("TOOL_SERVERS is not valid JSON: {}", e),
                })?
            }
            _ => HashMap::new(),
        };

        Ok(Config {
            llm,
            database,
            logging,
            request,
            engine,
            tool_servers,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .and_then(|s| match s.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            force_conclusion: false,
            executive_summary_enabled: true,
            summarization: SummarizationPolicy::default(),
        }
    }
}

impl Default for SummarizationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5000,
            unit: SizeUnit::Tokens,
            summary_max_tokens: 1000,
        }
    }
}

impl SummarizationPolicy {
    /// Measure `text` in this policy's unit.
    pub fn measure(&self, text: &str) -> usize {
        let chars = text.chars().count();
        match self.unit {
            SizeUnit::Chars => chars,
            SizeUnit::Tokens => chars.div_ceil(4),
        }
    }

    /// Whether `text` is large enough to be summarized.
    pub fn should_summarize(&self, text: &str) -> bool {
        self.enabled && self.measure(text) > self.threshold
    }
}
