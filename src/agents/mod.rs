//! Agents module - capability invocation.
//!
//! Every unit of work in a turn (planning, task execution, validation,
//! human review, aggregation) is a capability invoked through
//! [`CapabilityInvoker`]. [`GenericAgent`] is the LLM-backed implementation:
//! it renders the capability's prompts, decodes the reply against the output
//! descriptor and, for query-backed capabilities, runs the generated query.

mod context;
mod generic;
mod types;

pub use context::AgentContext;
pub use generic::GenericAgent;
pub use types::{AgentError, Invocation};

use async_trait::async_trait;

use crate::workflow::Params;

/// Invokes named capabilities.
///
/// # Postconditions
/// - `Ok` carries the decoded output, the tokens spent and any queries run
/// - `Err` means the capability produced nothing usable; tokens spent on a
///   failed attempt are not reported
#[async_trait]
pub trait CapabilityInvoker: Send + Sync {
    async fn invoke(&self, capability: &str, params: &Params) -> Result<Invocation, AgentError>;
}
