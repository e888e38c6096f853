//! Aggregators that run after validation, over the delivered task outputs.

use serde_json::Value;

use super::ledger::{QueryLog, TokenLedger, Transcript};
use super::types::{Params, TaskOutput, TurnContext};
use crate::agents::{AgentError, CapabilityInvoker, Invocation};
use crate::capability::{ExplicitAgentSpec, InputSource};

pub struct Aggregators<'a> {
    invoker: &'a dyn CapabilityInvoker,
    specs: &'a [ExplicitAgentSpec],
}

impl<'a> Aggregators<'a> {
    pub fn new(invoker: &'a dyn CapabilityInvoker, specs: &'a [ExplicitAgentSpec]) -> Self {
        Self { invoker, specs }
    }

    /// Run every aggregator in declaration order.
    ///
    /// An aggregator contributes all of its entries or none of them; a failed
    /// one is logged and skipped.
    pub async fn run(
        &self,
        turn: &TurnContext,
        outputs: &[TaskOutput],
        transcript: &mut Transcript,
        ledger: &mut TokenLedger,
        queries: &mut QueryLog,
    ) {
        for spec in self.specs {
            match self.run_one(spec, turn, outputs).await {
                Ok(contributions) => {
                    tracing::debug!(
                        aggregator = %spec.name,
                        entries = contributions.len(),
                        "Aggregator finished"
                    );
                    for contribution in contributions {
                        ledger.record(contribution.usage);
                        queries.extend(contribution.queries);
                        transcript.push(spec.name.clone(), contribution.output);
                    }
                }
                Err(e) => tracing::warn!(aggregator = %spec.name, "Aggregator failed: {}", e),
            }
        }
    }

    async fn run_one(
        &self,
        spec: &ExplicitAgentSpec,
        turn: &TurnContext,
        outputs: &[TaskOutput],
    ) -> Result<Vec<Invocation>, AgentError> {
        let groups: Vec<&[TaskOutput]> = if spec.per_task {
            outputs.iter().map(std::slice::from_ref).collect()
        } else {
            vec![outputs]
        };

        let mut contributions = Vec::with_capacity(groups.len());
        for group in groups {
            let params = bind_inputs(spec, turn, group);
            let invocation = self.invoker.invoke(&spec.name, &params).await?;
            let output = invocation
                .project(spec.output_field.as_deref())
                .ok_or_else(|| AgentError::MissingField(spec.output_field.clone().unwrap_or_default()))?;
            contributions.push(Invocation { output, ..invocation });
        }
        Ok(contributions)
    }
}

fn bind_inputs(spec: &ExplicitAgentSpec, turn: &TurnContext, outputs: &[TaskOutput]) -> Params {
    let mut params = Params::new();
    for binding in &spec.inputs {
        let value = match &binding.source {
            InputSource::UserInput => Value::String(turn.user_input.clone()),
            InputSource::ConversationHistory => Value::String(turn.conversation_history.clone()),
            InputSource::UserDetails => turn.user_details.to_value(),
            InputSource::Literal { value } => value.clone(),
            InputSource::TaskOutputs { field } => Value::Array(
                outputs
                    .iter()
                    .map(|o| match field {
                        Some(name) => o.output.get(name).cloned().unwrap_or_else(|| o.output.clone()),
                        None => o.output.clone(),
                    })
                    .collect(),
            ),
        };
        params.insert(binding.param.clone(), value);
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{standard_registry, ScriptedInvoker};
    use serde_json::json;

    fn outputs() -> Vec<TaskOutput> {
        vec![
            TaskOutput {
                task_id: 0,
                capability: "sales_agent".to_string(),
                output: json!({"total": 42, "note": "Q3"}),
            },
            TaskOutput {
                task_id: 1,
                capability: "hr_agent".to_string(),
                output: json!("12 people"),
            },
        ]
    }

    fn turn() -> TurnContext {
        TurnContext::new("Sales and headcount?", "", Default::default())
    }

    #[tokio::test]
    async fn test_summary_sees_all_outputs_and_records_projected_field() {
        let registry = standard_registry();
        let invoker = ScriptedInvoker::new();
        invoker.queue("summary_agent", json!({"summary": "42 sales, 12 people", "extra": 1}), 30, 6);

        let mut transcript = Transcript::new("", "Sales and headcount?");
        let mut ledger = TokenLedger::default();
        Aggregators::new(&invoker, registry.explicit_agents())
            .run(&turn(), &outputs(), &mut transcript, &mut ledger, &mut QueryLog::default())
            .await;

        let params = &invoker.calls_to("summary_agent")[0];
        assert_eq!(params["user_input"], json!("Sales and headcount?"));
        assert_eq!(
            params["other_agents_response"],
            json!([{"total": 42, "note": "Q3"}, "12 people"])
        );

        let last = transcript.last().expect("entry");
        assert_eq!(last.name, "summary_agent");
        assert_eq!(last.content, json!("42 sales, 12 people"));
        assert_eq!(ledger.total_tokens(), 36);
    }

    #[tokio::test]
    async fn test_failed_aggregator_is_skipped() {
        let registry = standard_registry();
        let invoker = ScriptedInvoker::new();
        invoker.queue_failure("summary_agent", "down");

        let mut transcript = Transcript::new("", "q");
        let mut ledger = TokenLedger::default();
        Aggregators::new(&invoker, registry.explicit_agents())
            .run(&turn(), &outputs(), &mut transcript, &mut ledger, &mut QueryLog::default())
            .await;

        assert_eq!(transcript.len(), 1);
        assert_eq!(ledger.total_tokens(), 0);
    }

    #[tokio::test]
    async fn test_per_task_aggregator_commits_all_or_nothing() {
        let specs: Vec<ExplicitAgentSpec> = serde_yaml::from_str(
            r#"
- name: formatter_agent
  per_task: true
  output_field: formatted
  inputs:
    - param: response
      from: task_outputs
      field: total
    - param: style
      from: literal
      value: brief
"#,
        )
        .expect("specs");

        let invoker = ScriptedInvoker::new();
        invoker.queue("formatter_agent", json!({"formatted": "42"}), 5, 1);
        invoker.queue("formatter_agent", json!({"other": "no formatted field"}), 5, 1);

        let mut transcript = Transcript::new("", "q");
        let mut ledger = TokenLedger::default();
        Aggregators::new(&invoker, &specs)
            .run(&turn(), &outputs(), &mut transcript, &mut ledger, &mut QueryLog::default())
            .await;

        let calls = invoker.calls_to("formatter_agent");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["response"], json!([42]));
        assert_eq!(calls[1]["response"], json!(["12 people"]));
        assert_eq!(calls[0]["style"], json!("brief"));

        // The second group lacked the projected field, so nothing is kept.
        assert_eq!(transcript.len(), 1);
        assert_eq!(ledger.total_tokens(), 0);
    }
}
