//! LLM-backed capability invocation.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{AgentContext, AgentError, CapabilityInvoker, Invocation};
use crate::capability::{CapabilitySpec, DataSourceBinding};
use crate::datasource::clean_query;
use crate::llm::{extract_json, strip_code_fence, ChatMessage, TokenUsage};
use crate::workflow::Params;

/// Field a plain capability may wrap its real answer in.
const WRAPPED_RESPONSE_FIELD: &str = "ai_response";

/// Invokes any registered capability through the LLM.
///
/// For query-backed capabilities the model writes a query, which is run
/// against the bound data source; the rows (or an `{"error": ...}` payload)
/// become the output.
pub struct GenericAgent {
    ctx: AgentContext,
}

impl GenericAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    /// Render the prompt, call the model and decode the reply.
    async fn complete(
        &self,
        spec: &CapabilitySpec,
        vars: &Params,
    ) -> Result<(Value, TokenUsage), AgentError> {
        let messages = vec![
            ChatMessage::system(spec.prompts.render(vars)),
            ChatMessage::user(spec.output.format_instructions()),
        ];
        let model = self.ctx.model_for(spec.model.as_deref());

        let response = self
            .ctx
            .llm
            .chat_completion(model, &messages, &spec.options)
            .await
            .map_err(|e| AgentError::Llm(e.to_string()))?;
        let usage = response.usage.unwrap_or_default();

        let content = response
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or(AgentError::EmptyResponse)?;

        // Free-form capabilities answer in plain text unless the whole reply is JSON.
        let raw = if spec.output.is_empty() {
            whole_json(&content).unwrap_or_else(|| Value::String(content.trim().to_string()))
        } else {
            extract_json(&content).map_err(|e| AgentError::InvalidJson(e.to_string()))?
        };

        Ok((spec.output.decode(&raw)?, usage))
    }

    /// Ask the binding's table selector which tables matter. `None` means use all.
    async fn select_tables(
        &self,
        binding: &DataSourceBinding,
        params: &Params,
        usage: &mut TokenUsage,
    ) -> Option<Vec<String>> {
        let selector = binding.table_selector.as_deref()?;
        match self.invoke(selector, params).await {
            Ok(selection) => {
                *usage += selection.usage;
                let names: Vec<String> = selection
                    .output
                    .get("table_names")?
                    .as_array()?
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                tracing::debug!(selector, tables = ?names, "Selected tables");
                Some(names)
            }
            Err(e) => {
                tracing::warn!(selector, "Table selection failed, using every table: {}", e);
                None
            }
        }
    }

    async fn invoke_query_backed(
        &self,
        spec: &CapabilitySpec,
        binding: &DataSourceBinding,
        params: &Params,
    ) -> Result<Invocation, AgentError> {
        let mut usage = TokenUsage::default();
        let selected = self.select_tables(binding, params, &mut usage).await;

        let mut vars = params.clone();
        vars.insert(
            "table_context".to_string(),
            Value::String(binding.table_context(selected.as_deref())),
        );

        let (output, spent) = self.complete(spec, &vars).await?;
        usage += spent;

        let query = query_text(&output, &binding.query_field)
            .map(|q| clean_query(&q))
            .filter(|q| !q.is_empty())
            .ok_or_else(|| AgentError::MissingField(binding.query_field.clone()))?;

        let rows = match self.ctx.data_sources.execute(&binding.source, &query).await {
            Ok(rows) => reparse(rows),
            Err(e) => {
                tracing::warn!(capability = %spec.name, source = %binding.source, "Query failed: {}", e);
                json!({ "error": e.to_string() })
            }
        };

        Ok(Invocation::new(rows, usage).with_query(query))
    }
}

#[async_trait]
impl CapabilityInvoker for GenericAgent {
    async fn invoke(&self, capability: &str, params: &Params) -> Result<Invocation, AgentError> {
        let spec = self.ctx.registry.get(capability)?;
        tracing::debug!(capability, "Invoking capability");

        match &spec.data_source {
            Some(binding) => self.invoke_query_backed(spec, binding, params).await,
            None => {
                let (output, usage) = self.complete(spec, params).await?;
                Ok(Invocation::new(unwrap_response(output), usage))
            }
        }
    }
}

fn query_text(output: &Value, field: &str) -> Option<String> {
    match output {
        Value::String(s) => Some(s.clone()),
        other => other.get(field)?.as_str().map(str::to_string),
    }
}

/// A reply that is, in full, a JSON object or array.
fn whole_json(content: &str) -> Option<Value> {
    let body = strip_code_fence(content.trim());
    if !looks_structured(body) {
        return None;
    }
    serde_json::from_str(body).ok()
}

fn looks_structured(text: &str) -> bool {
    text.starts_with('{') || text.starts_with('[')
}

/// Serialized JSON objects and arrays become structured data; other text,
/// including bare numbers and booleans, stays a string.
fn reparse(value: Value) -> Value {
    match value {
        Value::String(text) if looks_structured(text.trim()) => {
            serde_json::from_str(text.trim()).unwrap_or(Value::String(text))
        }
        other => other,
    }
}

fn unwrap_response(output: Value) -> Value {
    match output {
        Value::Object(mut map) if map.contains_key(WRAPPED_RESPONSE_FIELD) => map
            .remove(WRAPPED_RESPONSE_FIELD)
            .map(reparse)
            .unwrap_or(Value::Null),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityRegistry, CapabilitySpec, WorkflowManifest};
    use crate::datasource::{DataSources, SqliteDataSource};
    use crate::llm::Role;
    use crate::testing::{role_capabilities, ScriptedLlm};
    use std::sync::Arc;

    fn spec(yaml: &str) -> CapabilitySpec {
        serde_yaml::from_str(yaml).expect("capability yaml")
    }

    fn agent(llm: Arc<ScriptedLlm>, specs: Vec<CapabilitySpec>, sources: DataSources) -> GenericAgent {
        let mut all = role_capabilities();
        all.extend(specs);
        let registry =
            CapabilityRegistry::from_parts(WorkflowManifest::default(), all).expect("registry");
        GenericAgent::new(AgentContext::new(
            llm,
            Arc::new(registry),
            Arc::new(sources),
            "test/model",
        ))
    }

    fn params(value: Value) -> Params {
        value.as_object().cloned().expect("object")
    }

    #[tokio::test]
    async fn test_invoke_decodes_reply_and_counts_tokens() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.reply("```json\n{\"summary\": \"Revenue grew\", \"confidence\": \"0.9\"}\n```", 120, 30);

        let agent = agent(
            llm.clone(),
            vec![spec(
                r#"
name: summary_agent
model: special/model
prompts:
  system: "Summarize for {user_name}: {other_agents_response}"
output:
  - name: summary
    type: str
  - name: confidence
    type: float
"#,
            )],
            DataSources::new(),
        );

        let result = agent
            .invoke(
                "summary_agent",
                &params(json!({"user_name": "Ana", "other_agents_response": ["a", "b"]})),
            )
            .await
            .expect("invoke");

        assert_eq!(result.output, json!({"summary": "Revenue grew", "confidence": 0.9}));
        assert_eq!(result.usage, TokenUsage::new(120, 30));
        assert!(result.queries.is_empty());

        let calls = llm.calls();
        assert_eq!(calls[0].0, "special/model");
        assert_eq!(calls[0].1[0].role, Role::System);
        assert_eq!(calls[0].1[0].content, "## System:\nSummarize for Ana: [\"a\",\"b\"]");
        assert!(calls[0].1[1].content.contains("\"summary\" (string)"));
    }

    #[tokio::test]
    async fn test_invoke_unwraps_ai_response() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.reply(r#"{"ai_response": "[{\"k\": 1}]"}"#, 10, 5);
        let agent = agent(
            llm,
            vec![spec("name: lookup_agent\noutput:\n  - name: ai_response\n    type: str\n")],
            DataSources::new(),
        );
        let result = agent.invoke("lookup_agent", &Params::new()).await.expect("invoke");
        assert_eq!(result.output, json!([{"k": 1}]));
    }

    #[tokio::test]
    async fn test_invoke_rejects_reply_missing_fields() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.reply(r#"{"other": 1}"#, 10, 5);
        let agent = agent(
            llm,
            vec![spec("name: summary_agent\noutput:\n  - name: summary\n    type: str\n")],
            DataSources::new(),
        );
        let err = agent.invoke("summary_agent", &Params::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Schema(_)));
    }

    #[tokio::test]
    async fn test_invoke_unknown_capability() {
        let agent = agent(Arc::new(ScriptedLlm::new()), vec![], DataSources::new());
        let err = agent.invoke("ghost_agent", &Params::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Registry(_)));
    }

    #[tokio::test]
    async fn test_free_form_capability_accepts_text() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.reply("Please contact the finance team.", 8, 6);
        let agent = agent(llm, vec![], DataSources::new());
        let result = agent.invoke("human_agent", &Params::new()).await.expect("invoke");
        assert_eq!(result.output, json!("Please contact the finance team."));
    }

    #[tokio::test]
    async fn test_free_form_reply_with_brackets_stays_text() {
        let llm = Arc::new(ScriptedLlm::new());
        let reply = "Your request was logged as ticket [42]. A colleague will follow up.";
        llm.reply(reply, 8, 6);
        llm.reply("```json\n{\"handoff\": true}\n```", 4, 2);
        let agent = agent(llm, vec![], DataSources::new());

        let result = agent.invoke("human_agent", &Params::new()).await.expect("invoke");
        assert_eq!(result.output, json!(reply));

        let result = agent.invoke("human_agent", &Params::new()).await.expect("invoke");
        assert_eq!(result.output, json!({"handoff": true}));
    }

    #[tokio::test]
    async fn test_plain_scalar_ai_response_stays_text() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.reply(r#"{"ai_response": "42"}"#, 3, 1);
        llm.reply(r#"{"ai_response": "true"}"#, 3, 1);
        let agent = agent(
            llm,
            vec![spec("name: lookup_agent\noutput:\n  - name: ai_response\n    type: str\n")],
            DataSources::new(),
        );

        let result = agent.invoke("lookup_agent", &Params::new()).await.expect("invoke");
        assert_eq!(result.output, json!("42"));
        let result = agent.invoke("lookup_agent", &Params::new()).await.expect("invoke");
        assert_eq!(result.output, json!("true"));
    }

    #[tokio::test]
    async fn test_query_backed_capability_runs_query() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db = dir.path().join("warehouse.db");
        rusqlite::Connection::open(&db)
            .expect("open")
            .execute_batch("CREATE TABLE sales (region TEXT, amount REAL); INSERT INTO sales VALUES ('EMEA', 3.5);")
            .expect("seed");
        let mut sources = DataSources::new();
        sources.insert("warehouse", Arc::new(SqliteDataSource::new(db)));

        let llm = Arc::new(ScriptedLlm::new());
        llm.reply(r#"{"table_names": ["sales"]}"#, 5, 1);
        llm.reply(r#"{"ai_response": "SELECT \"region\", amount FROM sales"}"#, 50, 10);

        let agent = agent(
            llm.clone(),
            vec![
                spec("name: table_picker\noutput:\n  - name: table_names\n    type: list[str]\n"),
                spec(
                    r#"
name: sales_agent
prompts:
  system: "Tables:\n{table_context}"
output:
  - name: ai_response
    type: str
data_source:
  source: warehouse
  table_selector: table_picker
  tables:
    - name: sales
      notes: one row per order
    - name: staff
      notes: one row per employee
"#,
                ),
            ],
            sources,
        );

        let result = agent.invoke("sales_agent", &Params::new()).await.expect("invoke");
        assert_eq!(result.output, json!([{"region": "EMEA", "amount": 3.5}]));
        assert_eq!(result.queries, vec!["SELECT region, amount FROM sales".to_string()]);
        assert_eq!(result.usage, TokenUsage::new(55, 11));

        let prompt = &llm.calls()[1].1[0].content;
        assert!(prompt.contains("### sales\none row per order"));
        assert!(!prompt.contains("staff"));
    }

    #[tokio::test]
    async fn test_query_failure_becomes_error_payload() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db = dir.path().join("warehouse.db");
        rusqlite::Connection::open(&db).expect("open");
        let mut sources = DataSources::new();
        sources.insert("warehouse", Arc::new(SqliteDataSource::new(db)));

        let llm = Arc::new(ScriptedLlm::new());
        llm.reply(r#"{"ai_response": "SELECT * FROM nowhere"}"#, 20, 4);
        let agent = agent(
            llm,
            vec![spec(
                "name: sales_agent\noutput:\n  - name: ai_response\n    type: str\ndata_source:\n  source: warehouse\n",
            )],
            sources,
        );

        let result = agent.invoke("sales_agent", &Params::new()).await.expect("invoke");
        let error = result.output["error"].as_str().expect("error payload");
        assert!(error.contains("nowhere"));
        assert_eq!(result.queries.len(), 1);
    }

    #[tokio::test]
    async fn test_llm_failure_is_an_error() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.fail("upstream timeout");
        let agent = agent(llm, vec![], DataSources::new());
        let err = agent.invoke("human_agent", &Params::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Llm(msg) if msg.contains("upstream timeout")));
    }
}
