//! SQLite data source.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Value};

use super::{DataSource, DataSourceError};

pub struct SqliteDataSource {
    path: PathBuf,
    max_rows: usize,
}

impl SqliteDataSource {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            max_rows: 1000,
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}

fn run_query(path: &Path, query: &str, max_rows: usize) -> Result<Value, DataSourceError> {
    // Generated SQL never gets write access.
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| DataSourceError::Connection(e.to_string()))?;

    let mut stmt = conn
        .prepare(query)
        .map_err(|e| DataSourceError::Query(e.to_string()))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt
        .query([])
        .map_err(|e| DataSourceError::Query(e.to_string()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| DataSourceError::Query(e.to_string()))? {
        if out.len() >= max_rows {
            tracing::warn!(max_rows, "Query result truncated");
            break;
        }
        let mut record = Map::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            let value = row
                .get_ref(i)
                .map_err(|e| DataSourceError::Query(e.to_string()))?;
            record.insert(name.clone(), to_json(value));
        }
        out.push(Value::Object(record));
    }
    Ok(Value::Array(out))
}

#[async_trait]
impl DataSource for SqliteDataSource {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn execute(&self, query: &str) -> Result<Value, DataSourceError> {
        let path = self.path.clone();
        let query = query.to_string();
        let max_rows = self.max_rows;
        tokio::task::spawn_blocking(move || run_query(&path, &query, max_rows))
            .await
            .map_err(|e| DataSourceError::Query(format!("query task failed: {}", e)))?
    }
}
