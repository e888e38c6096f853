//! Task execution with the "empty result on failure" policy.

use crate::agents::{CapabilityInvoker, Invocation};

use super::Params;

/// Run one task capability.
///
/// A failed invocation never aborts the turn: it is logged and reported as an
/// empty result with zero tokens, which the validator then judges like any
/// other output.
pub async fn execute_task(
    invoker: &dyn CapabilityInvoker,
    capability: &str,
    params: &Params,
) -> Invocation {
    match invoker.invoke(capability, params).await {
        Ok(invocation) => {
            tracing::debug!(
                capability,
                input_tokens = invocation.usage.prompt_tokens,
                output_tokens = invocation.usage.completion_tokens,
                "Task finished"
            );
            invocation
        }
        Err(e) => {
            tracing::warn!(capability, "Task failed, recording empty result: {}", e);
            Invocation::empty()
        }
    }
}
