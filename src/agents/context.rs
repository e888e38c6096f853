//! Agent execution context - what a capability invocation may reach.

use std::sync::Arc;

use crate::capability::CapabilityRegistry;
use crate::datasource::DataSources;
use crate::llm::LlmClient;

/// Shared, read-only context for one user's turn.
///
/// # Thread Safety
/// Every component is behind an `Arc`, so a context is cheap to clone into
/// concurrently executing tasks.
#[derive(Clone)]
pub struct AgentContext {
    /// LLM client for model calls
    pub llm: Arc<dyn LlmClient>,

    /// Capabilities visible to this user
    pub registry: Arc<CapabilityRegistry>,

    /// Targets for query-backed capabilities
    pub data_sources: Arc<DataSources>,

    /// Model used when a capability does not name one
    pub default_model: String,
}

impl AgentContext {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        registry: Arc<CapabilityRegistry>,
        data_sources: Arc<DataSources>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            registry,
            data_sources,
            default_model: default_model.into(),
        }
    }

    /// Model for `capability`, honoring a per-capability override.
    pub fn model_for<'a>(&'a self, capability_model: Option<&'a str>) -> &'a str {
        capability_model.unwrap_or(&self.default_model)
    }
}
