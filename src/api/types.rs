//! API request and response types.

use serde::{Deserialize, Serialize};

use super::conversation_store::{StoredMessage, ThreadSummary};
use crate::capability::{AgentToggle, CapabilityOverride};
use crate::workflow::{TurnOutcome, UserDetails};

/// Request to run one turn.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AskRequest {
    pub user_input: Option<String>,
    pub user_details: Option<UserDetails>,
    /// Continue an existing thread; a new one is created when absent.
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub thread_id: String,
    #[serde(flatten)]
    pub outcome: TurnOutcome,
}

/// Conversation-history request, dispatched on `func_name`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConvHistoryRequest {
    pub func_name: Option<String>,
    pub user_input: Option<String>,
    pub user_details: Option<UserDetails>,
    pub thread_id: Option<String>,
    pub message_id: Option<String>,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConvHistoryResponse {
    /// Prior-turn history of the thread, one message per line.
    pub conversation_history: Option<String>,
    pub thread_id: Option<String>,
    pub short_name: String,
    pub chat_conversation: Option<Vec<StoredMessage>>,
    pub user_chat_history: Option<Vec<ThreadSummary>>,
    pub feedback: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentsQuery {
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentsListResponse {
    pub agents: Vec<AgentToggle>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToggleAgentRequest {
    pub user: Option<String>,
    pub agent_name: Option<String>,
    pub enable: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigureAgentRequest {
    pub user: Option<String>,
    pub agent_name: Option<String>,
    pub config_data: Option<CapabilityOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfigQuery {
    pub agent_name: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether conversations survive a restart
    pub persistent_store: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
