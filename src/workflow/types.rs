//! Values that flow between the workflow stages of one turn.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Named inputs of a capability invocation.
pub type Params = Map<String, Value>;

/// One step of a task plan as produced by the planning capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    #[serde(default)]
    pub question: String,

    #[serde(rename = "function_name")]
    pub capability: String,

    /// Literal values, bound positionally to the capability's parameters.
    #[serde(rename = "function_params", default)]
    pub parameters: Vec<String>,

    /// Index of the plan entry whose output this entry consumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<usize>,

    /// Parameter slot that receives the dependency's output. Falls back to
    /// the capability's declared dependency slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_to: Option<String>,
}

impl PlanEntry {
    pub fn new(capability: impl Into<String>, parameters: Vec<String>) -> Self {
        Self {
            question: String::new(),
            capability: capability.into(),
            parameters,
            depends_on: None,
            bind_to: None,
        }
    }

    pub fn depending_on(mut self, index: usize) -> Self {
        self.depends_on = Some(index);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    #[serde(default)]
    pub tasks: Vec<PlanEntry>,
}

/// Result of one executed plan entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: usize,
    #[serde(rename = "function_name")]
    pub capability: String,
    pub output: Value,
}

impl TaskOutput {
    /// Length used for the validation bypass check: character count for
    /// text, serialized JSON length for anything else.
    pub fn serialized_len(&self) -> usize {
        match &self.output {
            Value::String(s) => s.chars().count(),
            other => other.to_string().chars().count(),
        }
    }
}

/// Problems the validation capability found with one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Reply of the validation capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    #[serde(default)]
    pub validation_status: bool,
    #[serde(default)]
    pub validation_errors: Vec<ValidationIssue>,
}

impl ValidationVerdict {
    pub fn rejected(agent_name: &str, error: impl Into<String>) -> Self {
        Self {
            validation_status: false,
            validation_errors: vec![ValidationIssue {
                agent_name: agent_name.to_string(),
                errors: vec![error.into()],
                suggestions: Vec::new(),
            }],
        }
    }

    /// Suggestions of every issue, one per line.
    pub fn suggested_corrections(&self) -> String {
        self.validation_errors
            .iter()
            .flat_map(|issue| {
                issue
                    .suggestions
                    .iter()
                    .map(move |s| format!("{}: {}", issue.agent_name, s))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Why an attempt was rejected, fed back to the planner on the next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryContextEntry {
    pub attempt: u32,
    pub errors: Vec<ValidationIssue>,
    pub task_outputs: Vec<TaskOutput>,
    pub suggested_corrections: String,
}

/// Caller-supplied details about who is asking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "email_id")]
    pub user_mail: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserDetails {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Read-only inputs of one user turn.
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    pub user_input: String,
    pub conversation_history: String,
    pub user_details: UserDetails,
}

impl TurnContext {
    pub fn new(
        user_input: impl Into<String>,
        conversation_history: impl Into<String>,
        user_details: UserDetails,
    ) -> Self {
        Self {
            user_input: user_input.into(),
            conversation_history: conversation_history.into(),
            user_details,
        }
    }
}
