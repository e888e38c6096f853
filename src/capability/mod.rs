//! Capability definitions and the registry that loads them.
//!
//! A capability is a named unit of work: prompt templates, an output
//! descriptor, and optionally a data source whose query the model writes.
//! Definitions live in YAML files under the config directory and are
//! validated when the registry is loaded, never at invocation time.

mod prompt;
mod registry;
mod schema;

pub use prompt::{flatten_yaml, render_template, PromptOverride, PromptSet};
pub use registry::{
    AgentToggle, CapabilityOverride, CapabilityRegistry, ExplicitAgentSpec, InputBinding,
    InputSource, RegistryError, RegistryLoader, WorkflowManifest, WorkflowRoles,
};
pub use schema::{FieldDescriptor, FieldKind, OutputDescriptor, SchemaError};

use serde::{Deserialize, Serialize};

use crate::llm::ChatOptions;

/// A capability as declared in `capabilities/<name>.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,

    /// Shown to the planner in the function catalogue.
    #[serde(default)]
    pub description: String,

    /// Ordered input names. Positional plan parameters bind to these.
    #[serde(default)]
    pub parameters: Vec<String>,

    /// Slot filled by a prior task's output when a plan entry depends on one.
    /// Defaults to the first declared parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_param: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default)]
    pub options: ChatOptions,

    #[serde(default)]
    pub prompts: PromptSet,

    #[serde(default)]
    pub output: OutputDescriptor,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<DataSourceBinding>,
}

impl CapabilitySpec {
    /// Parameter slot that receives a dependency's output.
    pub fn dependency_slot(&self) -> &str {
        self.dependency_param
            .as_deref()
            .or_else(|| self.parameters.first().map(String::as_str))
            .unwrap_or("input")
    }

    pub fn is_query_backed(&self) -> bool {
        self.data_source.is_some()
    }
}

/// Ties a capability to a configured data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceBinding {
    /// Identifier from `data_sources.yaml`.
    pub source: String,

    /// Output field holding the generated query.
    #[serde(default = "default_query_field")]
    pub query_field: String,

    /// Table notes injected into the prompt as `{table_context}`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<TableNotes>,

    /// Capability that picks the relevant tables before the query is written.
    /// Its output must carry a `table_names` list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_selector: Option<String>,
}

fn default_query_field() -> String {
    "ai_response".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableNotes {
    pub name: String,
    #[serde(default, deserialize_with = "notes_text")]
    pub notes: String,
}

fn notes_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    Ok(flatten_yaml(&value))
}

impl DataSourceBinding {
    /// Table notes joined into one prompt section, restricted to `selected`
    /// when a selection was made.
    pub fn table_context(&self, selected: Option<&[String]>) -> String {
        self.tables
            .iter()
            .filter(|t| match selected {
                Some(names) => names.iter().any(|n| n.eq_ignore_ascii_case(&t.name)),
                None => true,
            })
            .map(|t| format!("### {}\n{}", t.name, t.notes))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_yaml() {
        let spec: CapabilitySpec = serde_yaml::from_str(
            r#"
name: revenue_agent
description: Answers revenue questions from the warehouse.
parameters: [question, region]
prompts:
  system: You write SQL for {region}.
  example:
    Question: total revenue
    Answer: SELECT SUM(amount) FROM sales
output:
  - name: ai_response
    type: str
data_source:
  source: warehouse
  tables:
    - name: sales
      notes: one row per order
    - name: regions
      notes:
        columns: [id, name]
"#,
        )
        .expect("capability yaml");

        assert_eq!(spec.dependency_slot(), "question");
        assert!(spec.is_query_backed());
        assert_eq!(
            spec.prompts.example,
            "**Question** : total revenue\n**Answer** : SELECT SUM(amount) FROM sales"
        );

        let binding = spec.data_source.as_ref().expect("binding");
        assert_eq!(binding.query_field, "ai_response");
        assert_eq!(
            binding.table_context(Some(&["SALES".to_string()])),
            "### sales\none row per order"
        );
        assert!(binding.table_context(None).contains("### regions\n**columns** :\nid\nname"));
    }

    #[test]
    fn test_dependency_slot_fallbacks() {
        let mut spec: CapabilitySpec =
            serde_yaml::from_str("name: bare").expect("minimal capability");
        assert_eq!(spec.dependency_slot(), "input");
        spec.dependency_param = Some("context".to_string());
        assert_eq!(spec.dependency_slot(), "context");
    }
}
