//! Per-turn bookkeeping: token totals, the transcript and the query log.
//!
//! All three are owned by a single turn and only ever grow.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::llm::TokenUsage;

/// Running input/output token totals of one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenLedger {
    input_tokens: u64,
    output_tokens: u64,
}

impl TokenLedger {
    pub fn record(&mut self, usage: TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(usage.prompt_tokens);
        self.output_tokens = self.output_tokens.saturating_add(usage.completion_tokens);
    }

    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> u64 {
        self.output_tokens
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// One `{name: content}` step of the transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub name: String,
    pub content: Value,
}

impl Serialize for TranscriptEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.name, &self.content)?;
        map.end()
    }
}

/// Append-only record of every stage's contribution within one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    conversation_history: String,
    present_conversation: Vec<TranscriptEntry>,
}

pub const USER_INPUT_ENTRY: &str = "user_input";

impl Transcript {
    pub fn new(conversation_history: impl Into<String>, user_input: &str) -> Self {
        Self {
            conversation_history: conversation_history.into(),
            present_conversation: vec![TranscriptEntry {
                name: USER_INPUT_ENTRY.to_string(),
                content: Value::String(user_input.to_string()),
            }],
        }
    }

    pub fn push(&mut self, name: impl Into<String>, content: Value) {
        self.present_conversation.push(TranscriptEntry {
            name: name.into(),
            content,
        });
    }

    pub fn conversation_history(&self) -> &str {
        &self.conversation_history
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.present_conversation
    }

    pub fn len(&self) -> usize {
        self.present_conversation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present_conversation.is_empty()
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.present_conversation.last()
    }

    /// Most recent entry recorded under `name`.
    pub fn find(&self, name: &str) -> Option<&TranscriptEntry> {
        self.present_conversation.iter().rev().find(|e| e.name == name)
    }
}

/// Queries generated during one turn, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct QueryLog {
    queries: Vec<String>,
}

impl QueryLog {
    pub fn extend(&mut self, queries: impl IntoIterator<Item = String>) {
        self.queries.extend(queries);
    }

    pub fn as_slice(&self) -> &[String] {
        &self.queries
    }

    pub fn into_vec(self) -> Vec<String> {
        self.queries
    }
}
