//! Conversation storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database

mod memory;
mod sqlite;

pub use memory::InMemoryConversationStore;
pub use sqlite::SqliteConversationStore;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::StoreBackend;

pub const HUMAN_PREFIX: &str = "HumanMessage=";
pub const AI_PREFIX: &str = "AIMessage=";

const DEFAULT_SHORT_NAME: &str = "New Chat";

const STOP_WORDS: &[&str] = &[
    "about", "above", "after", "again", "against", "all", "also", "and", "any", "are", "because",
    "been", "before", "being", "below", "between", "both", "but", "can", "could", "did", "does",
    "doing", "down", "during", "each", "few", "for", "from", "further", "get", "give", "had",
    "has", "have", "having", "her", "here", "hers", "him", "his", "how", "into", "its", "just",
    "last", "let", "made", "make", "many", "may", "more", "most", "much", "must", "not", "now",
    "off", "once", "only", "other", "our", "ours", "out", "over", "own", "please", "same", "she",
    "should", "show", "some", "such", "tell", "than", "that", "the", "their", "them", "then",
    "there", "these", "they", "this", "those", "through", "too", "under", "until", "very", "was",
    "were", "what", "when", "where", "which", "while", "who", "whom", "why", "will", "with",
    "would", "you", "your", "yours",
];

/// A chat thread owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub short_name: String,
    pub email_id: String,
    pub created_at: String,
}

/// One persisted side of an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub content: String,
    pub step: i64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub feedback: String,
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Short display name for a thread, derived from its first question.
///
/// Up to three capitalized words longer than two characters that are not
/// stop words; the first three words if none qualify.
pub fn short_name(question: &str) -> String {
    let words: Vec<&str> = question
        .split(|c: char| c.is_whitespace() || (c.is_ascii_punctuation() && c != '\'' && c != '-'))
        .filter(|w| !w.is_empty())
        .collect();

    let meaningful: Vec<String> = words
        .iter()
        .filter(|w| w.chars().count() > 2)
        .filter(|w| !STOP_WORDS.contains(&w.to_lowercase().as_str()))
        .take(3)
        .map(|w| capitalize(w))
        .collect();

    if !meaningful.is_empty() {
        return meaningful.join(" ");
    }
    if words.is_empty() {
        return DEFAULT_SHORT_NAME.to_string();
    }
    words.into_iter().take(3).collect::<Vec<_>>().join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Prior-turn history text handed to the workflow: stored contents in step
/// order, one per line.
pub fn history_text(messages: &[StoredMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Conversation store trait - implemented by all storage backends.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Create a new thread for `email_id`.
    async fn create_thread(&self, email_id: &str, short_name: &str)
        -> Result<ThreadSummary, String>;

    /// Threads of one user, oldest first.
    async fn list_threads(&self, email_id: &str) -> Result<Vec<ThreadSummary>, String>;

    async fn thread(&self, thread_id: &str) -> Result<Option<ThreadSummary>, String>;

    /// Append one human/assistant exchange and return both stored messages.
    ///
    /// The human message takes step `max + 1` (0 on an empty thread) and the
    /// assistant message the step after it, carrying the turn's token totals.
    async fn append_exchange(
        &self,
        thread_id: &str,
        human: &str,
        assistant: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<Vec<StoredMessage>, String>;

    /// Messages of a thread ordered by step.
    async fn messages(&self, thread_id: &str) -> Result<Vec<StoredMessage>, String>;

    /// Returns whether a message with that id existed.
    async fn update_feedback(&self, message_id: &str, feedback: &str) -> Result<bool, String>;
}

/// The two rows written for one exchange, starting at `step`.
pub(crate) fn exchange_messages(
    step: i64,
    human: &str,
    assistant: &str,
    input_tokens: u64,
    output_tokens: u64,
) -> Vec<StoredMessage> {
    vec![
        StoredMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            content: format!("{}{}", HUMAN_PREFIX, human),
            step,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            feedback: String::new(),
        },
        StoredMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            content: format!("{}{}", AI_PREFIX, assistant),
            step: step + 1,
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
            feedback: String::new(),
        },
    ]
}

/// Create a conversation store for the configured backend.
pub async fn create_conversation_store(
    backend: StoreBackend,
    database_path: PathBuf,
) -> Result<Arc<dyn ConversationStore>, String> {
    match backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryConversationStore::new())),
        StoreBackend::Sqlite => {
            let store = SqliteConversationStore::new(database_path).await?;
            Ok(Arc::new(store))
        }
    }
}
