//! Agent result and error types.

use serde_json::Value;
use thiserror::Error;

use crate::capability::{RegistryError, SchemaError};
use crate::llm::TokenUsage;

/// Errors from a single capability invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Model returned no content")]
    EmptyResponse,

    #[error("Model reply is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Model reply does not match the output descriptor: {0}")]
    Schema(#[from] SchemaError),

    #[error("Field '{0}' missing from result")]
    MissingField(String),
}

/// What one capability invocation produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    pub output: Value,
    pub usage: TokenUsage,
    /// Queries generated and executed while producing `output`.
    pub queries: Vec<String>,
}

impl Invocation {
    pub fn new(output: Value, usage: TokenUsage) -> Self {
        Self {
            output,
            usage,
            queries: Vec::new(),
        }
    }

    /// The "produced nothing usable" result: `{}` with zero tokens.
    pub fn empty() -> Self {
        Self::new(Value::Object(Default::default()), TokenUsage::default())
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.queries.push(query.into());
        self
    }

    /// `output[field]` if present, otherwise the whole output.
    pub fn project(&self, field: Option<&str>) -> Option<Value> {
        match field {
            Some(name) => self.output.get(name).cloned(),
            None => Some(self.output.clone()),
        }
    }
}
