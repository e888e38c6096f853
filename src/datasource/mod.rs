//! Data sources that query-backed capabilities run their generated SQL against.

mod sqlite;

pub use sqlite::SqliteDataSource;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::llm::strip_code_fence;

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("unknown data source '{0}'")]
    Unknown(String),

    #[error("failed to load data source config {}: {message}", .path.display())]
    Config { path: PathBuf, message: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),
}

/// Something a generated query can be executed against.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Run `query` and return the rows as a JSON array of objects.
    async fn execute(&self, query: &str) -> Result<Value, DataSourceError>;
}

/// Entry of `data_sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSourceConfig {
    Sqlite {
        path: PathBuf,
        #[serde(default = "default_max_rows")]
        max_rows: usize,
    },
}

fn default_max_rows() -> usize {
    1000
}

#[derive(Debug, Deserialize)]
struct DataSourcesFile {
    #[serde(default)]
    sources: HashMap<String, DataSourceConfig>,
}

/// Configured data sources by identifier.
#[derive(Clone, Default)]
pub struct DataSources {
    sources: HashMap<String, Arc<dyn DataSource>>,
}

impl DataSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, source: Arc<dyn DataSource>) {
        self.sources.insert(id.into(), source);
    }

    /// Load `data_sources.yaml`. A missing file means no data sources.
    /// Relative SQLite paths resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self, DataSourceError> {
        if !path.is_file() {
            tracing::info!(path = %path.display(), "No data source config; query-backed capabilities unavailable");
            return Ok(Self::new());
        }
        let config_err = |message: String| DataSourceError::Config {
            path: path.to_path_buf(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| config_err(e.to_string()))?;
        let file: DataSourcesFile =
            serde_yaml::from_str(&text).map_err(|e| config_err(e.to_string()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut sources = Self::new();
        for (id, config) in file.sources {
            let source: Arc<dyn DataSource> = match config {
                DataSourceConfig::Sqlite { path, max_rows } => {
                    let resolved = if path.is_absolute() { path } else { base.join(path) };
                    Arc::new(SqliteDataSource::new(resolved).with_max_rows(max_rows))
                }
            };
            tracing::info!(id = %id, kind = source.kind(), "Registered data source");
            sources.insert(id, source);
        }
        Ok(sources)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn DataSource>, DataSourceError> {
        self.sources
            .get(id)
            .cloned()
            .ok_or_else(|| DataSourceError::Unknown(id.to_string()))
    }

    /// Normalize `query` and run it against source `id`.
    pub async fn execute(&self, id: &str, query: &str) -> Result<Value, DataSourceError> {
        let source = self.get(id)?;
        let cleaned = clean_query(query);
        tracing::debug!(source = id, query = %cleaned, "Executing generated query");
        source.execute(&cleaned).await
    }
}

/// Normalize a model-written query before execution.
///
/// Drops Markdown fences, unquotes plain identifiers (`"order_id"` becomes
/// `order_id`) and collapses runs of whitespace.
pub fn clean_query(query: &str) -> String {
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();
    let quoted = QUOTED.get_or_init(|| Regex::new(r#""([A-Za-z0-9_]+)""#).expect("quoted identifier regex is valid"));
    let spaces = SPACES.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex is valid"));

    let body = strip_code_fence(query.trim());
    let unquoted = quoted.replace_all(body, "$1");
    spaces.replace_all(&unquoted, " ").trim().to_string()
}
