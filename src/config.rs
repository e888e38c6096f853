//! Configuration management for Ask Ellis.
//!
//! Configuration is read from environment variables:
//! - `OPENROUTER_API_KEY` - Required. Key for the OpenAI-compatible chat endpoint.
//! - `LLM_API_URL` - Optional. Base URL of the endpoint. Defaults to OpenRouter.
//! - `DEFAULT_MODEL` - Optional. Model used when a capability does not name one.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `5000`.
//! - `CONFIG_DIR` - Optional. Capability registry root. Defaults to `./config_files`.
//! - `DATABASE_PATH` - Optional. SQLite conversation store. Defaults to `./data/ask_ellis.db`.
//! - `CONVERSATION_STORE` - Optional. `sqlite` (default) or `memory`.
//! - `ERROR_TOLERANCE_COUNT` - Optional. Maximum validation retries. Defaults to `3`.
//! - `MAXIMUM_AGENT_OUTPUT_TOKEN_LENGTH` - Optional. Validation bypass threshold. Defaults to `10000`.
//! - `MAXIMUM_CONVERSATION_HISTORY_LENGTH` - Optional. History compaction threshold. Defaults to `8000`.
//! - `PARALLEL_INDEPENDENT_TASKS` - Optional. Run dependency-free tasks concurrently. Defaults to `false`.
//! - `ESCALATION_FALLBACK_MESSAGE` - Optional. Answer used when human review itself fails.

use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_LLM_API_URL: &str = "https://openrouter.ai/api/v1";

pub const DEFAULT_ESCALATION_MESSAGE: &str =
    "I could not produce a reliable answer for this request. It has been flagged for human review; \
     consider adjusting agent selection or parameters based on errors.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Where conversations are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

/// Run-wide constants consumed by the workflow core.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Validation failures tolerated before escalating to human review.
    pub max_retries: u32,

    /// Serialized output length at which validation is bypassed.
    pub max_output_length: usize,

    /// Prior-history length (characters) that triggers compaction.
    pub max_history_length: usize,

    /// Execute plan entries of the same dependency depth concurrently.
    pub parallel_tasks: bool,

    pub escalation_fallback: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_output_length: 10_000,
            max_history_length: 8_000,
            parallel_tasks: false,
            escalation_fallback: DEFAULT_ESCALATION_MESSAGE.to_string(),
        }
    }
}

impl WorkflowConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_retries: env_or("ERROR_TOLERANCE_COUNT", defaults.max_retries)?,
            max_output_length: env_or("MAXIMUM_AGENT_OUTPUT_TOKEN_LENGTH", defaults.max_output_length)?,
            max_history_length: env_or(
                "MAXIMUM_CONVERSATION_HISTORY_LENGTH",
                defaults.max_history_length,
            )?,
            parallel_tasks: env_or("PARALLEL_INDEPENDENT_TASKS", defaults.parallel_tasks)?,
            escalation_fallback: std::env::var("ESCALATION_FALLBACK_MESSAGE")
                .unwrap_or(defaults.escalation_fallback),
        })
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API key for the chat completion endpoint
    pub api_key: String,

    /// Base URL of the chat completion endpoint
    pub llm_api_url: String,

    /// Model used when a capability does not name one
    pub default_model: String,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Root of the capability registry
    pub config_dir: PathBuf,

    /// SQLite file backing the conversation store
    pub database_path: PathBuf,

    pub store_backend: StoreBackend,

    pub workflow: WorkflowConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set,
    /// and `ConfigError::InvalidValue` for any value that fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let llm_api_url =
            std::env::var("LLM_API_URL").unwrap_or_else(|_| DEFAULT_LLM_API_URL.to_string());

        let default_model =
            std::env::var("DEFAULT_MODEL").unwrap_or_else(|_| "openai/gpt-4o-mini".to_string());

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_or("PORT", 5000u16)?;

        let config_dir = std::env::var("CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config_files"));

        let database_path = std::env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data").join("ask_ellis.db"));

        let store_backend = env_or("CONVERSATION_STORE", StoreBackend::Sqlite)?;

        Ok(Self {
            api_key,
            llm_api_url,
            default_model,
            host,
            port,
            config_dir,
            database_path,
            store_backend,
            workflow: WorkflowConfig::from_env()?,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, default_model: String, config_dir: PathBuf) -> Self {
        Self {
            api_key,
            llm_api_url: DEFAULT_LLM_API_URL.to_string(),
            default_model,
            host: "127.0.0.1".to_string(),
            port: 5000,
            database_path: config_dir.join("ask_ellis.db"),
            config_dir,
            store_backend: StoreBackend::Memory,
            workflow: WorkflowConfig::default(),
        }
    }
}

/// Parse an optional environment variable, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_uses_default_when_unset() {
        let value: u32 = env_or("ASK_ELLIS_TEST_UNSET_VARIABLE", 7).expect("default");
        assert_eq!(value, 7);
    }

    #[test]
    fn test_env_or_rejects_garbage() {
        std::env::set_var("ASK_ELLIS_TEST_BAD_NUMBER", "three");
        let err = env_or::<u32>("ASK_ELLIS_TEST_BAD_NUMBER", 3).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(name, _) if name == "ASK_ELLIS_TEST_BAD_NUMBER"));
        std::env::remove_var("ASK_ELLIS_TEST_BAD_NUMBER");
    }

    #[test]
    fn test_env_or_parses_bool_and_backend() {
        std::env::set_var("ASK_ELLIS_TEST_FLAG", " true ");
        std::env::set_var("ASK_ELLIS_TEST_STORE", "Memory");
        assert!(env_or("ASK_ELLIS_TEST_FLAG", false).expect("bool"));
        assert_eq!(
            env_or("ASK_ELLIS_TEST_STORE", StoreBackend::Sqlite).expect("backend"),
            StoreBackend::Memory
        );
        std::env::remove_var("ASK_ELLIS_TEST_FLAG");
        std::env::remove_var("ASK_ELLIS_TEST_STORE");
    }

    #[test]
    fn test_workflow_defaults() {
        let workflow = WorkflowConfig::default();
        assert_eq!(workflow.max_retries, 3);
        assert_eq!(workflow.max_output_length, 10_000);
        assert!(!workflow.parallel_tasks);
    }
}
