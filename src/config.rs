//! Environment-driven engine configuration.
//!
//! `DATABASE_URL` is optional: absence (or an unreachable database) selects
//! the in-memory checkpointer with a startup warning, and the server still
//! serves requests. The LLM provider key is required. Per-integration
//! bearer tokens arrive per request and are never persisted; only the
//! default search key may come from the environment.

use std::{sync::Arc, time::Duration};

use miette::Diagnostic;
use thiserror::Error;
use tracing::warn;

use crate::registry::IntegrationTokens;
use crate::runtime::{Checkpointer, InMemoryCheckpointer, SqliteCheckpointer};

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    #[diagnostic(
        code(planweave::config::missing),
        help("Set the variable in the environment or a .env file.")
    )]
    Missing(&'static str),
}

/// Engine configuration resolved once at startup.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Durable checkpointer URL, e.g. `sqlite://planweave.db`. Absent
    /// selects the in-memory backend.
    pub database_url: Option<String>,
    pub gemini_api_key: String,
    pub gemini_model: String,
    /// Base URL of the tool-server fleet the dispatcher posts to.
    pub tool_server_url: String,
    pub bind_addr: String,
    /// Per-call timeout for outbound LLM requests.
    pub llm_timeout: Duration,
    /// Wall-clock budget for one step execution (LLM plus tool loop).
    pub step_timeout: Duration,
    /// Default search credential applied when a request carries none.
    pub tavily_api_key: Option<String>,
}

impl EngineConfig {
    /// Resolve configuration from the environment (and `.env`, if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let gemini_api_key =
            std::env::var("GEMINI_API_KEY").map_err(|_| ConfigError::Missing("GEMINI_API_KEY"))?;
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            gemini_api_key,
            gemini_model: std::env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
            tool_server_url: std::env::var("TOOL_SERVER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8790".to_string()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            llm_timeout: secs_var("LLM_TIMEOUT_SECS", 120),
            step_timeout: secs_var("STEP_TIMEOUT_SECS", 180),
            tavily_api_key: std::env::var("TAVILY_API_KEY").ok().filter(|v| !v.is_empty()),
        })
    }

    /// Default token bag applied underneath request-supplied tokens.
    #[must_use]
    pub fn default_tokens(&self) -> IntegrationTokens {
        IntegrationTokens {
            tavily_api_key: self.tavily_api_key.clone(),
            ..Default::default()
        }
    }

    /// Connect the durable checkpointer, falling back to in-memory with a
    /// warning when the database is absent or unreachable. The fallback
    /// applies at startup only; write failures after startup stay fatal to
    /// their request.
    pub async fn build_checkpointer(&self) -> Arc<dyn Checkpointer> {
        match &self.database_url {
            Some(url) => match SqliteCheckpointer::connect(url).await {
                Ok(cp) => Arc::new(cp),
                Err(err) => {
                    warn!(error = %err, "durable checkpointer unreachable, using in-memory store");
                    Arc::new(InMemoryCheckpointer::new())
                }
            },
            None => {
                warn!("DATABASE_URL not set, using in-memory checkpointer");
                Arc::new(InMemoryCheckpointer::new())
            }
        }
    }
}

fn secs_var(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}
