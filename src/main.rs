use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use incident_engine::{
    chain::{Alert, ChainDefinition, RunOverrides},
    config::{Config, LogFormat},
    llm::HttpLlmClient,
    session::CancelOutcome,
    storage::{Page, SessionFilter, SessionStatus, SqliteStorage},
    tools::StdioToolServerFactory,
    AppState,
};

/// Incident investigation engine
#[derive(Parser, Debug)]
#[command(name = "incident-engine", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Investigate an alert and wait for the result
    Run {
        /// Chain definition (JSON)
        #[arg(long)]
        chain: PathBuf,

        /// Alert (JSON)
        #[arg(long)]
        alert: PathBuf,
    },

    /// Resume a paused session and wait for the result
    Resume {
        session: String,

        /// Iteration budget for the resumed agents
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Conclude at the limit instead of pausing again
        #[arg(long)]
        force_conclusion: bool,
    },

    /// Cancel a session, or one parallel branch of it
    Cancel {
        session: String,

        /// Branch execution to cancel instead of the whole session
        #[arg(long)]
        stage_execution: Option<String>,
    },

    /// List sessions, newest first
    Sessions {
        /// Filter by status: pending, in_progress, paused, completed, failed, cancelled
        #[arg(long)]
        status: Option<SessionStatus>,

        #[arg(long, default_value = "0")]
        offset: i64,

        #[arg(long, default_value = "50")]
        limit: i64,
    },

    /// Show a session with its stage executions
    Show { session: String },

    /// Show the interaction history of a session
    Interactions {
        session: String,

        #[arg(long, default_value = "0")]
        offset: i64,

        #[arg(long, default_value = "200")]
        limit: i64,
    },

    /// Ask a follow-up question about a finished session
    Chat {
        session: String,
        message: String,

        #[arg(long)]
        author: String,
    },

    /// Fail sessions left in progress by a crashed process
    Recover,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Incident engine starting..."
    );

    // Initialize storage
    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    // Initialize LLM client
    let llm = match HttpLlmClient::new(&config.llm, config.request.clone()) {
        Ok(c) => {
            info!(base_url = %c.base_url(), model = %config.llm.model, "LLM client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize LLM client");
            return Err(e.into());
        }
    };

    let tools = StdioToolServerFactory::new(config.tool_servers.clone())
        .with_timeout(Duration::from_millis(config.request.timeout_ms));
    let state = AppState::new(config, Arc::new(storage), Arc::new(llm), Arc::new(tools));
    let service = &state.service;

    match cli.command {
        Command::Run { chain, alert } => {
            let chain: ChainDefinition = read_json(&chain)?;
            let alert: Alert = read_json(&alert)?;
            let session_id = service.submit_alert(alert, chain).await?;
            info!(session_id = %session_id, "Waiting for investigation to finish");
            print_json(&service.wait(&session_id).await?)?;
        }
        Command::Resume {
            session,
            max_iterations,
            force_conclusion,
        } => {
            let overrides = RunOverrides {
                max_iterations,
                force_conclusion: force_conclusion.then_some(true),
            };
            service.resume(&session, overrides).await?;
            print_json(&service.wait(&session).await?)?;
        }
        Command::Cancel {
            session,
            stage_execution,
        } => {
            let outcome = match stage_execution {
                Some(execution_id) => service.cancel_branch(&session, &execution_id).await?,
                None => service.cancel(&session).await?,
            };
            match outcome {
                CancelOutcome::Cancelled => println!("cancelled"),
                CancelOutcome::Cancelling => println!("cancelling"),
            }
            // A cancelled paused branch may have resumed the chain.
            service.wait(&session).await?;
        }
        Command::Sessions {
            status,
            offset,
            limit,
        } => {
            let page = service
                .list_sessions(&SessionFilter { status }, Page::new(offset, limit))
                .await?;
            print_json(&page)?;
        }
        Command::Show { session } => {
            let detail = service.session_detail(&session).await?;
            print_json(&serde_json::json!({
                "session": detail.session,
                "stages": detail.stages,
            }))?;
        }
        Command::Interactions {
            session,
            offset,
            limit,
        } => {
            let page = service
                .interactions(&session, Page::new(offset, limit))
                .await?;
            print_json(&page)?;
        }
        Command::Chat {
            session,
            message,
            author,
        } => {
            let chat = match state.chat.session_chats(&session).await?.into_iter().last() {
                Some(chat) => chat,
                None => state.chat.create_chat(&session, &author).await?,
            };
            let reply = state.chat.post_message(&chat.chat_id, &message, &author).await?;
            println!("{}", reply.content);
        }
        Command::Recover => {
            let recovered = service.recover_orphans().await?;
            println!("{} session(s) recovered", recovered);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
