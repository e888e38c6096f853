//! Agent listing and per-user configuration endpoints.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};

use super::routes::{internal_error, missing_parameter, ApiError, ApiResult, AppState};
use super::types::*;
use crate::capability::{CapabilitySpec, RegistryError, RegistryLoader};

/// Run blocking registry file IO off the async runtime.
async fn with_loader<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(RegistryLoader) -> Result<T, RegistryError> + Send + 'static,
    T: Send + 'static,
{
    let loader = state.registry.clone();
    tokio::task::spawn_blocking(move || f(loader))
        .await
        .map_err(internal_error)?
        .map_err(registry_error)
}

fn registry_error(err: RegistryError) -> ApiError {
    match err {
        RegistryError::UnknownCapability(name) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("Unknown agent: {}", name),
                details: None,
            }),
        ),
        RegistryError::UnstorableName(name) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: format!("Agent name cannot be configured: {}", name),
                details: None,
            }),
        ),
        RegistryError::InvalidUser(user) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: format!("Invalid user: {}", user),
                details: None,
            }),
        ),
        other => internal_error(other),
    }
}

/// `GET /agents_list?user=`
pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentsQuery>,
) -> ApiResult<AgentsListResponse> {
    let agents = with_loader(&state, move |loader| {
        loader
            .load(query.user.as_deref())
            .map(|registry| registry.agents().to_vec())
    })
    .await?;
    Ok(Json(AgentsListResponse { agents }))
}

/// `POST /enable_disable_agent`
pub async fn enable_disable_agent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ToggleAgentRequest>,
) -> ApiResult<MessageResponse> {
    let user = req.user.ok_or_else(|| missing_parameter("user"))?;
    let agent_name = req.agent_name.ok_or_else(|| missing_parameter("agent_name"))?;
    let enable = req.enable.ok_or_else(|| missing_parameter("enable"))?;

    let name = agent_name.clone();
    with_loader(&state, move |loader| loader.save_toggle(&user, &name, enable)).await?;

    let verb = if enable { "enabled" } else { "disabled" };
    Ok(Json(MessageResponse {
        message: format!("{} {} successfully", agent_name, verb),
    }))
}

/// `POST /configure-agent`: save a per-user prompt/description override.
pub async fn configure_agent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConfigureAgentRequest>,
) -> ApiResult<MessageResponse> {
    let user = req.user.ok_or_else(|| missing_parameter("user"))?;
    let agent_name = req.agent_name.ok_or_else(|| missing_parameter("agent_name"))?;
    let change = req.config_data.ok_or_else(|| missing_parameter("config_data"))?;

    with_loader(&state, move |loader| loader.save_override(&user, &agent_name, &change)).await?;

    Ok(Json(MessageResponse {
        message: "Agent configured successfully".to_string(),
    }))
}

/// `GET /fetch_agent_config?agent_name=&user=`: the effective definition.
pub async fn fetch_agent_config(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentConfigQuery>,
) -> ApiResult<CapabilitySpec> {
    let agent_name = query
        .agent_name
        .ok_or_else(|| missing_parameter("agent_name"))?;
    let user = query.user;

    let spec = with_loader(&state, move |loader| {
        let registry = loader.load(user.as_deref())?;
        registry.get(&agent_name).cloned()
    })
    .await?;
    Ok(Json(spec))
}
