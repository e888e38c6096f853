//! Test doubles shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::agents::{AgentError, CapabilityInvoker, Invocation};
use crate::capability::{CapabilityRegistry, CapabilitySpec, RegistryError, WorkflowManifest};
use crate::llm::{ChatMessage, ChatOptions, ChatResponse, LlmClient, TokenUsage};
use crate::workflow::Params;

/// LLM client that replays queued replies and records every request.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<ChatResponse, String>>>,
    calls: Mutex<Vec<(String, Vec<ChatMessage>)>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, content: &str, prompt_tokens: u64, completion_tokens: u64) {
        self.replies.lock().expect("lock").push_back(Ok(ChatResponse {
            content: Some(content.to_string()),
            finish_reason: Some("stop".to_string()),
            usage: Some(TokenUsage::new(prompt_tokens, completion_tokens)),
            model: None,
        }));
    }

    pub fn fail(&self, message: &str) {
        self.replies
            .lock()
            .expect("lock")
            .push_back(Err(message.to_string()));
    }

    pub fn calls(&self) -> Vec<(String, Vec<ChatMessage>)> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        self.calls
            .lock()
            .expect("lock")
            .push((model.to_string(), messages.to_vec()));
        match self.replies.lock().expect("lock").pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Err(anyhow::anyhow!("no scripted reply left")),
        }
    }
}

type Scripted = Result<Invocation, String>;

/// Capability invoker with per-capability scripted results.
///
/// Queued results are consumed first; once a capability's queue is empty its
/// fallback (if any) is returned on every call.
#[derive(Default)]
pub struct ScriptedInvoker {
    queued: Mutex<HashMap<String, VecDeque<Scripted>>>,
    fallback: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<(String, Params)>>,
    spent: Mutex<TokenUsage>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, capability: &str, output: Value, prompt: u64, completion: u64) -> &Self {
        self.queued
            .lock()
            .expect("lock")
            .entry(capability.to_string())
            .or_default()
            .push_back(Ok(Invocation::new(output, TokenUsage::new(prompt, completion))));
        self
    }

    pub fn queue_invocation(&self, capability: &str, invocation: Invocation) -> &Self {
        self.queued
            .lock()
            .expect("lock")
            .entry(capability.to_string())
            .or_default()
            .push_back(Ok(invocation));
        self
    }

    pub fn queue_failure(&self, capability: &str, message: &str) -> &Self {
        self.queued
            .lock()
            .expect("lock")
            .entry(capability.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
        self
    }

    pub fn always(&self, capability: &str, output: Value, prompt: u64, completion: u64) -> &Self {
        self.fallback.lock().expect("lock").insert(
            capability.to_string(),
            Ok(Invocation::new(output, TokenUsage::new(prompt, completion))),
        );
        self
    }

    pub fn calls(&self) -> Vec<(String, Params)> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn calls_to(&self, capability: &str) -> Vec<Params> {
        self.calls()
            .into_iter()
            .filter(|(name, _)| name == capability)
            .map(|(_, params)| params)
            .collect()
    }

    /// Sum of the usage of every successful scripted result handed out.
    pub fn total_usage(&self) -> TokenUsage {
        *self.spent.lock().expect("lock")
    }
}

#[async_trait]
impl CapabilityInvoker for ScriptedInvoker {
    async fn invoke(&self, capability: &str, params: &Params) -> Result<Invocation, AgentError> {
        self.calls
            .lock()
            .expect("lock")
            .push((capability.to_string(), params.clone()));

        let next = self
            .queued
            .lock()
            .expect("lock")
            .get_mut(capability)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.fallback.lock().expect("lock").get(capability).cloned());

        match next {
            Some(Ok(invocation)) => {
                *self.spent.lock().expect("lock") += invocation.usage;
                Ok(invocation)
            }
            Some(Err(message)) => Err(AgentError::Llm(message)),
            None => Err(AgentError::Registry(RegistryError::UnknownCapability(
                capability.to_string(),
            ))),
        }
    }
}

fn named(name: &str, parameters: &[&str]) -> CapabilitySpec {
    let mut spec: CapabilitySpec =
        serde_yaml::from_str(&format!("name: {}", name)).expect("minimal capability");
    spec.parameters = parameters.iter().map(|p| p.to_string()).collect();
    spec
}

/// Planner, validator and human-review capabilities with no prompts.
pub fn role_capabilities() -> Vec<CapabilitySpec> {
    vec![
        named("supervisor_agent", &[]),
        named("observer_agent", &[]),
        named("human_agent", &[]),
    ]
}

/// Registry with three task capabilities and a summary aggregator.
///
/// - `sales_agent(question, quarter)`
/// - `analyst_agent(question, data)`, dependency slot `data`
/// - `hr_agent(question)`
pub fn standard_registry() -> CapabilityRegistry {
    let manifest: WorkflowManifest = serde_yaml::from_str(
        r#"
agents_required:
  - name: sales_agent
  - name: analyst_agent
  - name: hr_agent
explicit_agents:
  - name: summary_agent
    output_field: summary
    inputs:
      - param: user_input
        from: user_input
      - param: other_agents_response
        from: task_outputs
"#,
    )
    .expect("manifest");

    let mut specs = role_capabilities();
    specs.push(named("summary_agent", &["user_input", "other_agents_response"]));
    specs.push(named("sales_agent", &["question", "quarter"]));
    let mut analyst = named("analyst_agent", &["question", "data"]);
    analyst.dependency_param = Some("data".to_string());
    specs.push(analyst);
    specs.push(named("hr_agent", &["question"]));

    CapabilityRegistry::from_parts(manifest, specs).expect("standard registry")
}
