//! Result validation with bounded re-planning and human escalation.
//!
//! ```text
//! VALIDATING --valid--------------------> ACCEPTED
//! VALIDATING --oversized output---------> BYPASSED
//! VALIDATING --invalid, retries left----> RETRY --re-plan--> VALIDATING
//! VALIDATING --invalid, retries spent---> ESCALATED
//! VALIDATING --no outputs---------------> ESCALATED
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ledger::{QueryLog, TokenLedger, Transcript};
use super::supervisor::Supervisor;
use super::types::{Params, RetryContextEntry, TaskOutput, TurnContext, ValidationVerdict};
use crate::agents::CapabilityInvoker;
use crate::capability::CapabilityRegistry;
use crate::config::WorkflowConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Validating,
    Retry,
    Accepted,
    Bypassed,
    Escalated,
}

impl ValidationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Bypassed | Self::Escalated)
    }

    /// Whether the task outputs made it into the transcript.
    pub fn delivered_outputs(self) -> bool {
        matches!(self, Self::Accepted | Self::Bypassed)
    }
}

/// How validation ended for one turn.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub state: ValidationState,
    pub retry_count: u32,
    /// Outputs of the last attempt.
    pub task_outputs: Vec<TaskOutput>,
    pub retry_context: Vec<RetryContextEntry>,
}

pub struct Observer<'a> {
    invoker: &'a dyn CapabilityInvoker,
    registry: &'a CapabilityRegistry,
    settings: &'a WorkflowConfig,
    supervisor: &'a Supervisor<'a>,
}

impl<'a> Observer<'a> {
    pub fn new(
        invoker: &'a dyn CapabilityInvoker,
        registry: &'a CapabilityRegistry,
        settings: &'a WorkflowConfig,
        supervisor: &'a Supervisor<'a>,
    ) -> Self {
        Self {
            invoker,
            registry,
            settings,
            supervisor,
        }
    }

    /// Drive the validation loop to a terminal state, appending the accepted
    /// outputs or the escalation reply to `transcript`.
    pub async fn run(
        &self,
        turn: &TurnContext,
        initial_outputs: Vec<TaskOutput>,
        transcript: &mut Transcript,
        ledger: &mut TokenLedger,
        queries: &mut QueryLog,
    ) -> ValidationReport {
        let mut state = ValidationState::Validating;
        let mut outputs = initial_outputs;
        let mut retry_count = 0u32;
        let mut retry_context: Vec<RetryContextEntry> = Vec::new();

        while !state.is_terminal() {
            state = match state {
                ValidationState::Validating => {
                    if outputs.is_empty() {
                        tracing::warn!(retry_count, "No task outputs to validate, escalating");
                        ValidationState::Escalated
                    } else if let Some(big) = outputs
                        .iter()
                        .find(|o| o.serialized_len() >= self.settings.max_output_length)
                    {
                        tracing::info!(
                            capability = %big.capability,
                            length = big.serialized_len(),
                            limit = self.settings.max_output_length,
                            "Output too large to validate, bypassing"
                        );
                        ValidationState::Bypassed
                    } else {
                        let verdict = self.validate(turn, &outputs, retry_count, ledger).await;
                        if verdict.validation_status {
                            ValidationState::Accepted
                        } else {
                            retry_count += 1;
                            tracing::info!(
                                retry_count,
                                max_retries = self.settings.max_retries,
                                issues = verdict.validation_errors.len(),
                                "Validation rejected task outputs"
                            );
                            retry_context.push(RetryContextEntry {
                                attempt: retry_count,
                                suggested_corrections: verdict.suggested_corrections(),
                                errors: verdict.validation_errors,
                                task_outputs: outputs.clone(),
                            });
                            if retry_count <= self.settings.max_retries {
                                ValidationState::Retry
                            } else {
                                ValidationState::Escalated
                            }
                        }
                    }
                }
                ValidationState::Retry => {
                    outputs = self
                        .supervisor
                        .plan_and_execute(turn, &retry_context, ledger, queries)
                        .await;
                    ValidationState::Validating
                }
                terminal => terminal,
            };
        }

        match state {
            ValidationState::Escalated => {
                let reply = self.escalate(turn, ledger).await;
                transcript.push(self.registry.roles().escalation.clone(), reply);
            }
            _ => {
                for output in &outputs {
                    transcript.push(output.capability.clone(), output.output.clone());
                }
            }
        }

        tracing::info!(?state, retry_count, "Validation finished");
        ValidationReport {
            state,
            retry_count,
            task_outputs: outputs,
            retry_context,
        }
    }

    /// One call to the validation capability. Any failure counts as a rejection.
    async fn validate(
        &self,
        turn: &TurnContext,
        outputs: &[TaskOutput],
        retry_count: u32,
        ledger: &mut TokenLedger,
    ) -> ValidationVerdict {
        let validator = &self.registry.roles().validator;

        let mut vars = Params::new();
        vars.insert(
            "task_outputs".to_string(),
            serde_json::to_value(outputs).unwrap_or(Value::Array(Vec::new())),
        );
        vars.insert("retry_count".to_string(), json!(retry_count));
        vars.insert("user_input".to_string(), Value::String(turn.user_input.clone()));
        vars.insert(
            "context".to_string(),
            json!({
                "conversation_history": turn.conversation_history,
                "user_details": turn.user_details.to_value(),
            }),
        );

        let invocation = match self.invoker.invoke(validator, &vars).await {
            Ok(invocation) => invocation,
            Err(e) => {
                tracing::warn!("Validation call failed: {}", e);
                return ValidationVerdict::rejected(validator, format!("validation failed: {}", e));
            }
        };
        ledger.record(invocation.usage);

        serde_json::from_value(invocation.output).unwrap_or_else(|e| {
            tracing::warn!("Validation reply unreadable: {}", e);
            ValidationVerdict::rejected(validator, format!("unreadable validation reply: {}", e))
        })
    }

    async fn escalate(&self, turn: &TurnContext, ledger: &mut TokenLedger) -> Value {
        let escalation = &self.registry.roles().escalation;

        let mut vars = Params::new();
        vars.insert("input_text".to_string(), Value::String(turn.user_input.clone()));
        vars.insert(
            "conversation_history".to_string(),
            Value::String(turn.conversation_history.clone()),
        );
        vars.insert("user_details".to_string(), turn.user_details.to_value());

        match self.invoker.invoke(escalation, &vars).await {
            Ok(invocation) => {
                ledger.record(invocation.usage);
                invocation.output
            }
            Err(e) => {
                tracing::error!("Escalation failed, using fallback reply: {}", e);
                Value::String(self.settings.escalation_fallback.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{standard_registry, ScriptedInvoker};

    const PLAN: &str = "supervisor_agent";
    const CHECK: &str = "observer_agent";
    const HUMAN: &str = "human_agent";

    fn turn() -> TurnContext {
        TurnContext::new("Total sales?", "", Default::default())
    }

    fn one_task_plan() -> Value {
        json!({"tasks": [{"question": "Total sales?", "function_name": "sales_agent", "function_params": ["Total sales?", "Q3"]}]})
    }

    fn outputs(value: Value) -> Vec<TaskOutput> {
        vec![TaskOutput {
            task_id: 0,
            capability: "sales_agent".to_string(),
            output: value,
        }]
    }

    fn rejection() -> Value {
        json!({
            "validation_status": false,
            "validation_errors": [{"agent_name": "sales_agent", "errors": ["wrong quarter"], "suggestions": ["use Q3"]}]
        })
    }

    struct Run {
        report: ValidationReport,
        transcript: Transcript,
        ledger: TokenLedger,
    }

    async fn run(invoker: &ScriptedInvoker, settings: &WorkflowConfig, initial: Vec<TaskOutput>) -> Run {
        let registry = standard_registry();
        let supervisor = Supervisor::new(invoker, &registry, settings);
        let observer = Observer::new(invoker, &registry, settings, &supervisor);
        let mut transcript = Transcript::new("", "Total sales?");
        let mut ledger = TokenLedger::default();
        let report = observer
            .run(&turn(), initial, &mut transcript, &mut ledger, &mut QueryLog::default())
            .await;
        Run {
            report,
            transcript,
            ledger,
        }
    }

    #[tokio::test]
    async fn test_valid_outputs_are_accepted() {
        let invoker = ScriptedInvoker::new();
        invoker.queue(CHECK, json!({"validation_status": true, "validation_errors": []}), 40, 4);

        let run = run(&invoker, &WorkflowConfig::default(), outputs(json!({"total": 42}))).await;

        assert_eq!(run.report.state, ValidationState::Accepted);
        assert_eq!(run.report.retry_count, 0);
        assert_eq!(run.transcript.last().expect("entry").name, "sales_agent");
        assert_eq!(run.transcript.len(), 2);
        assert_eq!(run.ledger.total_tokens(), 44);
        assert!(invoker.calls_to(PLAN).is_empty());
    }

    #[tokio::test]
    async fn test_rejections_replan_then_accept() {
        let invoker = ScriptedInvoker::new();
        invoker.queue(CHECK, rejection(), 10, 1);
        invoker.queue(CHECK, rejection(), 10, 1);
        invoker.queue(CHECK, json!({"validation_status": true}), 10, 1);
        invoker.always(PLAN, one_task_plan(), 20, 2);
        invoker.always("sales_agent", json!({"total": 7}), 5, 5);

        let run = run(&invoker, &WorkflowConfig::default(), outputs(json!({"total": 1}))).await;

        assert_eq!(run.report.state, ValidationState::Accepted);
        assert_eq!(run.report.retry_count, 2);
        assert_eq!(run.report.retry_context.len(), 2);
        assert_eq!(run.report.retry_context[0].suggested_corrections, "sales_agent: use Q3");
        assert_eq!(invoker.calls_to(PLAN).len(), 2);

        // The second re-plan sees both rejected attempts.
        let second_plan = &invoker.calls_to(PLAN)[1];
        assert_eq!(second_plan["retry_context"].as_array().map(Vec::len), Some(2));

        assert_eq!(run.transcript.last().expect("entry").content, json!({"total": 7}));
        assert_eq!(run.ledger.total_tokens(), invoker.total_usage().total_tokens);
    }

    #[tokio::test]
    async fn test_retries_are_bounded_then_escalated() {
        let settings = WorkflowConfig {
            max_retries: 3,
            ..Default::default()
        };
        let invoker = ScriptedInvoker::new();
        invoker.always(CHECK, rejection(), 10, 1);
        invoker.always(PLAN, one_task_plan(), 20, 2);
        invoker.always("sales_agent", json!({"total": 7}), 5, 5);
        invoker.queue(HUMAN, json!("A colleague will follow up."), 8, 8);

        let run = run(&invoker, &settings, outputs(json!({"total": 1}))).await;

        assert_eq!(run.report.state, ValidationState::Escalated);
        assert_eq!(run.report.retry_count, 4);
        assert_eq!(invoker.calls_to(CHECK).len(), 4);
        assert_eq!(invoker.calls_to(PLAN).len(), 3);
        assert_eq!(invoker.calls_to(HUMAN).len(), 1);

        let last = run.transcript.last().expect("entry");
        assert_eq!(last.name, HUMAN);
        assert_eq!(last.content, json!("A colleague will follow up."));
        // Rejected outputs never reach the transcript.
        assert!(run.transcript.find("sales_agent").is_none());
    }

    #[tokio::test]
    async fn test_oversized_output_bypasses_validation() {
        let settings = WorkflowConfig {
            max_output_length: 10,
            ..Default::default()
        };
        let invoker = ScriptedInvoker::new();

        let run = run(&invoker, &settings, outputs(json!("0123456789"))).await;

        assert_eq!(run.report.state, ValidationState::Bypassed);
        assert!(invoker.calls_to(CHECK).is_empty());
        assert_eq!(run.transcript.last().expect("entry").content, json!("0123456789"));
    }

    #[tokio::test]
    async fn test_one_oversized_output_bypasses_and_delivers_all() {
        let settings = WorkflowConfig {
            max_output_length: 10,
            ..Default::default()
        };
        let invoker = ScriptedInvoker::new();
        let initial = vec![
            TaskOutput {
                task_id: 0,
                capability: "sales_agent".to_string(),
                output: json!("a long sales answer"),
            },
            TaskOutput {
                task_id: 1,
                capability: "hr_agent".to_string(),
                output: json!("12"),
            },
        ];

        let run = run(&invoker, &settings, initial).await;

        assert_eq!(run.report.state, ValidationState::Bypassed);
        assert!(invoker.calls_to(CHECK).is_empty());
        assert!(invoker.calls_to(HUMAN).is_empty());

        let tail: Vec<(&str, &Value)> = run.transcript.entries()[1..]
            .iter()
            .map(|e| (e.name.as_str(), &e.content))
            .collect();
        assert_eq!(
            tail,
            vec![
                ("sales_agent", &json!("a long sales answer")),
                ("hr_agent", &json!("12")),
            ]
        );
    }

    #[tokio::test]
    async fn test_output_just_under_limit_is_validated() {
        let settings = WorkflowConfig {
            max_output_length: 10,
            ..Default::default()
        };
        let invoker = ScriptedInvoker::new();
        invoker.queue(CHECK, json!({"validation_status": true}), 1, 1);

        let run = run(&invoker, &settings, outputs(json!("012345678"))).await;

        assert_eq!(run.report.state, ValidationState::Accepted);
        assert_eq!(invoker.calls_to(CHECK).len(), 1);
    }

    #[tokio::test]
    async fn test_no_outputs_escalates_without_validation() {
        let invoker = ScriptedInvoker::new();
        invoker.queue(HUMAN, json!("Let me get someone."), 3, 3);

        let run = run(&invoker, &WorkflowConfig::default(), Vec::new()).await;

        assert_eq!(run.report.state, ValidationState::Escalated);
        assert!(invoker.calls_to(CHECK).is_empty());
        assert_eq!(invoker.calls_to(HUMAN)[0]["input_text"], json!("Total sales?"));
    }

    #[tokio::test]
    async fn test_validator_failure_counts_as_rejection() {
        let settings = WorkflowConfig {
            max_retries: 0,
            ..Default::default()
        };
        let invoker = ScriptedInvoker::new();
        invoker.queue_failure(CHECK, "timeout");
        invoker.queue_failure(HUMAN, "also down");

        let run = run(&invoker, &settings, outputs(json!({"total": 1}))).await;

        assert_eq!(run.report.state, ValidationState::Escalated);
        assert_eq!(run.report.retry_count, 1);
        assert_eq!(run.report.retry_context[0].errors[0].agent_name, CHECK);
        assert_eq!(
            run.transcript.last().expect("entry").content,
            json!(settings.escalation_fallback)
        );
    }
}
