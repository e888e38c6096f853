//! One user turn: plan, execute, validate, aggregate.
//!
//! All per-turn state (token ledger, transcript, query log, retry context) is
//! created inside [`Workflow::run_turn`] and never shared between turns.

mod executor;
mod explicit;
mod ledger;
mod observer;
mod supervisor;
mod types;

pub use executor::execute_task;
pub use explicit::Aggregators;
pub use ledger::{QueryLog, TokenLedger, Transcript, TranscriptEntry, USER_INPUT_ENTRY};
pub use observer::{Observer, ValidationReport, ValidationState};
pub use supervisor::{schedule, PlanError, Supervisor};
pub use types::{
    Params, PlanEntry, RetryContextEntry, TaskOutput, TaskPlan, TurnContext, UserDetails,
    ValidationIssue, ValidationVerdict,
};

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::agents::CapabilityInvoker;
use crate::capability::CapabilityRegistry;
use crate::config::WorkflowConfig;

/// Result of one turn, serialized as the ask endpoint's response body.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub conversation: Transcript,
    pub generated_queries: Vec<String>,
    pub input_tokens_count: u64,
    pub output_tokens_count: u64,
    pub terminal_state: ValidationState,
    pub retry_count: u32,
    /// Text persisted as the assistant side of the exchange.
    #[serde(skip)]
    pub answer: String,
}

pub struct Workflow {
    invoker: Arc<dyn CapabilityInvoker>,
    registry: Arc<CapabilityRegistry>,
    settings: WorkflowConfig,
}

impl Workflow {
    pub fn new(
        invoker: Arc<dyn CapabilityInvoker>,
        registry: Arc<CapabilityRegistry>,
        settings: WorkflowConfig,
    ) -> Self {
        Self {
            invoker,
            registry,
            settings,
        }
    }

    pub async fn run_turn(
        &self,
        user_input: &str,
        conversation_history: &str,
        user_details: UserDetails,
    ) -> TurnOutcome {
        let mut ledger = TokenLedger::default();
        let mut queries = QueryLog::default();

        let history = self.compact_history(conversation_history, &mut ledger).await;
        let turn = TurnContext::new(user_input, history.clone(), user_details);
        let mut transcript = Transcript::new(history, user_input);

        tracing::info!(
            input_len = user_input.len(),
            history_len = turn.conversation_history.len(),
            "Starting turn"
        );

        let invoker = self.invoker.as_ref();
        let supervisor = Supervisor::new(invoker, &self.registry, &self.settings);
        let initial = supervisor
            .plan_and_execute(&turn, &[], &mut ledger, &mut queries)
            .await;

        let observer = Observer::new(invoker, &self.registry, &self.settings, &supervisor);
        let report = observer
            .run(&turn, initial, &mut transcript, &mut ledger, &mut queries)
            .await;

        if report.state.delivered_outputs() {
            Aggregators::new(invoker, self.registry.explicit_agents())
                .run(&turn, &report.task_outputs, &mut transcript, &mut ledger, &mut queries)
                .await;
        }

        let answer = self.final_answer(&transcript);
        tracing::info!(
            state = ?report.state,
            retry_count = report.retry_count,
            input_tokens = ledger.input_tokens(),
            output_tokens = ledger.output_tokens(),
            queries = queries.as_slice().len(),
            "Turn finished"
        );

        TurnOutcome {
            conversation: transcript,
            generated_queries: queries.into_vec(),
            input_tokens_count: ledger.input_tokens(),
            output_tokens_count: ledger.output_tokens(),
            terminal_state: report.state,
            retry_count: report.retry_count,
            answer,
        }
    }

    /// Keep the prior history within the configured length, summarizing it
    /// when a summarizer is configured.
    async fn compact_history(&self, history: &str, ledger: &mut TokenLedger) -> String {
        let limit = self.settings.max_history_length;
        if history.chars().count() <= limit {
            return history.to_string();
        }

        if let Some(summarizer) = &self.registry.roles().history_summarizer {
            let mut vars = Params::new();
            vars.insert(
                "conversation_history".to_string(),
                Value::String(history.to_string()),
            );
            match self.invoker.invoke(summarizer, &vars).await {
                Ok(invocation) => {
                    ledger.record(invocation.usage);
                    let summary = invocation
                        .project(Some("summary"))
                        .unwrap_or(invocation.output);
                    tracing::debug!(summarizer = %summarizer, "Conversation history summarized");
                    return match summary {
                        Value::String(text) => text,
                        other => other.to_string(),
                    };
                }
                Err(e) => tracing::warn!(
                    summarizer = %summarizer,
                    "History summarization failed, keeping the most recent part: {}",
                    e
                ),
            }
        }

        tail(history, limit).to_string()
    }

    /// Summary entry if present, else the escalation reply, else the last entry.
    fn final_answer(&self, transcript: &Transcript) -> String {
        let entry = self
            .registry
            .explicit_agents()
            .iter()
            .rev()
            .find_map(|agent| transcript.find(&agent.name))
            .or_else(|| transcript.find(&self.registry.roles().escalation))
            .or_else(|| transcript.last());

        match entry.map(|e| &e.content) {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// The last `limit` characters of `text`.
fn tail(text: &str, limit: usize) -> &str {
    let skip = text.chars().count().saturating_sub(limit);
    match text.char_indices().nth(skip) {
        Some((start, _)) => &text[start..],
        None => "",
    }
}
