//! SQLite-backed conversation store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{exchange_messages, now_string, ConversationStore, StoredMessage, ThreadSummary};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS messages (
    thread_id TEXT NOT NULL,
    message_id TEXT NOT NULL UNIQUE,
    content TEXT,
    step INTEGER NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    feedback TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, step);

CREATE TABLE IF NOT EXISTS user_chat_history (
    email_id TEXT,
    thread_id TEXT NOT NULL UNIQUE,
    short_name TEXT,
    sent_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chat_history_email ON user_chat_history(email_id, sent_at);
"#;

pub struct SqliteConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConversationStore {
    pub async fn new(db_path: PathBuf) -> Result<Self, String> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create database dir: {}", e))?;
        }

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;
            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| format!("Task join error: {}", e))??;

        tracing::info!("Conversation store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadSummary> {
    Ok(ThreadSummary {
        thread_id: row.get(0)?,
        short_name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        email_id: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        created_at: row.get(3)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        message_id: row.get(0)?,
        content: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        step: row.get(2)?,
        input_tokens: row.get::<_, i64>(3)?.max(0) as u64,
        output_tokens: row.get::<_, i64>(4)?.max(0) as u64,
        total_tokens: row.get::<_, i64>(5)?.max(0) as u64,
        feedback: row.get(6)?,
    })
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create_thread(&self, email_id: &str, short_name: &str) -> Result<ThreadSummary, String> {
        let conn = Arc::clone(&self.conn);
        let thread = ThreadSummary {
            thread_id: Uuid::new_v4().to_string(),
            short_name: short_name.to_string(),
            email_id: email_id.to_string(),
            created_at: now_string(),
        };
        let row = thread.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO user_chat_history (email_id, thread_id, short_name, sent_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![row.email_id, row.thread_id, row.short_name, row.created_at],
            )
            .map_err(|e| e.to_string())?;
            Ok::<_, String>(())
        })
        .await
        .map_err(|e| e.to_string())??;

        Ok(thread)
    }

    async fn list_threads(&self, email_id: &str) -> Result<Vec<ThreadSummary>, String> {
        let conn = Arc::clone(&self.conn);
        let email_id = email_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(
                    "SELECT thread_id, short_name, email_id, sent_at
                     FROM user_chat_history WHERE email_id = ?1
                     ORDER BY sent_at ASC",
                )
                .map_err(|e| e.to_string())?;
            let threads = stmt
                .query_map(params![email_id], row_to_thread)
                .map_err(|e| e.to_string())?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            Ok(threads)
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn thread(&self, thread_id: &str) -> Result<Option<ThreadSummary>, String> {
        let conn = Arc::clone(&self.conn);
        let thread_id = thread_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT thread_id, short_name, email_id, sent_at
                 FROM user_chat_history WHERE thread_id = ?1",
                params![thread_id],
                row_to_thread,
            )
            .optional()
            .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn append_exchange(
        &self,
        thread_id: &str,
        human: &str,
        assistant: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<Vec<StoredMessage>, String> {
        let conn = Arc::clone(&self.conn);
        let thread_id = thread_id.to_string();
        let human = human.to_string();
        let assistant = assistant.to_string();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction().map_err(|e| e.to_string())?;

            let next_step: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(step) + 1, 0) FROM messages WHERE thread_id = ?1",
                    params![thread_id],
                    |row| row.get(0),
                )
                .map_err(|e| e.to_string())?;

            let rows = exchange_messages(next_step, &human, &assistant, input_tokens, output_tokens);
            for row in &rows {
                tx.execute(
                    "INSERT INTO messages
                        (thread_id, message_id, content, step, input_tokens, output_tokens, total_tokens, feedback)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        thread_id,
                        row.message_id,
                        row.content,
                        row.step,
                        row.input_tokens as i64,
                        row.output_tokens as i64,
                        row.total_tokens as i64,
                        row.feedback,
                    ],
                )
                .map_err(|e| e.to_string())?;
            }

            tx.commit().map_err(|e| e.to_string())?;
            Ok(rows)
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn messages(&self, thread_id: &str) -> Result<Vec<StoredMessage>, String> {
        let conn = Arc::clone(&self.conn);
        let thread_id = thread_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(
                    "SELECT message_id, content, step, input_tokens, output_tokens, total_tokens, feedback
                     FROM messages WHERE thread_id = ?1
                     ORDER BY step ASC",
                )
                .map_err(|e| e.to_string())?;
            let messages = stmt
                .query_map(params![thread_id], row_to_message)
                .map_err(|e| e.to_string())?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            Ok(messages)
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn update_feedback(&self, message_id: &str, feedback: &str) -> Result<bool, String> {
        let conn = Arc::clone(&self.conn);
        let message_id = message_id.to_string();
        let feedback = feedback.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let updated = conn
                .execute(
                    "UPDATE messages SET feedback = ?1 WHERE message_id = ?2",
                    params![feedback, message_id],
                )
                .map_err(|e| e.to_string())?;
            Ok(updated > 0)
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::conversation_store::history_text;

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("chat.db");

        let store = SqliteConversationStore::new(path.clone())
            .await
            .expect("open store");
        let thread = store
            .create_thread("ana@example.com", "Quarterly Sales")
            .await
            .expect("create thread");

        store
            .append_exchange(&thread.thread_id, "How were sales?", "Up 4%", 120, 30)
            .await
            .expect("append");
        let second = store
            .append_exchange(&thread.thread_id, "And Europe?", "Flat", 80, 20)
            .await
            .expect("append");
        assert_eq!(second[0].step, 2);
        assert_eq!(second[1].total_tokens, 100);

        assert!(store
            .update_feedback(&second[1].message_id, "helpful")
            .await
            .expect("feedback"));
        drop(store);

        // Data survives reopening.
        let store = SqliteConversationStore::new(path).await.expect("reopen");
        let messages = store.messages(&thread.thread_id).await.expect("messages");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[3].feedback, "helpful");
        assert_eq!(messages[1].input_tokens, 120);
        assert_eq!(
            history_text(&messages),
            "HumanMessage=How were sales?\nAIMessage=Up 4%\nHumanMessage=And Europe?\nAIMessage=Flat"
        );

        let found = store.thread(&thread.thread_id).await.expect("thread");
        assert_eq!(found.map(|t| t.short_name), Some("Quarterly Sales".to_string()));
        assert_eq!(store.list_threads("ana@example.com").await.expect("list").len(), 1);
        assert!(store.thread("nope").await.expect("thread").is_none());
    }
}
