//! In-memory conversation store (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{exchange_messages, now_string, ConversationStore, StoredMessage, ThreadSummary};

#[derive(Clone, Default)]
pub struct InMemoryConversationStore {
    threads: Arc<RwLock<Vec<ThreadSummary>>>,
    messages: Arc<RwLock<HashMap<String, Vec<StoredMessage>>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create_thread(&self, email_id: &str, short_name: &str) -> Result<ThreadSummary, String> {
        let thread = ThreadSummary {
            thread_id: Uuid::new_v4().to_string(),
            short_name: short_name.to_string(),
            email_id: email_id.to_string(),
            created_at: now_string(),
        };
        self.threads.write().await.push(thread.clone());
        Ok(thread)
    }

    async fn list_threads(&self, email_id: &str) -> Result<Vec<ThreadSummary>, String> {
        Ok(self
            .threads
            .read()
            .await
            .iter()
            .filter(|t| t.email_id == email_id)
            .cloned()
            .collect())
    }

    async fn thread(&self, thread_id: &str) -> Result<Option<ThreadSummary>, String> {
        Ok(self
            .threads
            .read()
            .await
            .iter()
            .find(|t| t.thread_id == thread_id)
            .cloned())
    }

    async fn append_exchange(
        &self,
        thread_id: &str,
        human: &str,
        assistant: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<Vec<StoredMessage>, String> {
        let mut messages = self.messages.write().await;
        let thread = messages.entry(thread_id.to_string()).or_default();
        let step = thread.iter().map(|m| m.step + 1).max().unwrap_or(0);
        let rows = exchange_messages(step, human, assistant, input_tokens, output_tokens);
        thread.extend(rows.iter().cloned());
        Ok(rows)
    }

    async fn messages(&self, thread_id: &str) -> Result<Vec<StoredMessage>, String> {
        let mut rows = self
            .messages
            .read()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or_default();
        rows.sort_by_key(|m| m.step);
        Ok(rows)
    }

    async fn update_feedback(&self, message_id: &str, feedback: &str) -> Result<bool, String> {
        let mut messages = self.messages.write().await;
        let found = messages
            .values_mut()
            .flat_map(|rows| rows.iter_mut())
            .find(|m| m.message_id == message_id);
        match found {
            Some(message) => {
                message.feedback = feedback.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
