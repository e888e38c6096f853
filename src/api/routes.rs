//! HTTP server setup and the turn endpoint.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agents::{AgentContext, CapabilityInvoker, GenericAgent};
use crate::capability::RegistryLoader;
use crate::config::Config;
use crate::datasource::DataSources;
use crate::llm::{LlmClient, OpenRouterClient};
use crate::workflow::{TurnOutcome, UserDetails, Workflow};

use super::agents as agents_api;
use super::conversation_store::{
    create_conversation_store, history_text, short_name, ConversationStore,
};
use super::conversations;
use super::types::*;

pub const DATA_SOURCES_FILE: &str = "data_sources.yaml";

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub llm: Arc<dyn LlmClient>,
    pub data_sources: Arc<DataSources>,
    /// Registries are loaded per request so configuration edits apply to the next turn
    pub registry: RegistryLoader,
    pub conversations: Arc<dyn ConversationStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        llm: Arc<dyn LlmClient>,
        data_sources: DataSources,
        conversations: Arc<dyn ConversationStore>,
    ) -> Self {
        let registry = RegistryLoader::new(config.config_dir.clone());
        Self {
            config,
            llm,
            data_sources: Arc::new(data_sources),
            registry,
            conversations,
        }
    }

    /// Run one turn with a fresh registry view, agent and workflow state.
    pub async fn run_turn(
        &self,
        user_input: &str,
        conversation_history: &str,
        user_details: UserDetails,
    ) -> anyhow::Result<TurnOutcome> {
        let loader = self.registry.clone();
        let user = user_details.user_name.clone();
        let registry = tokio::task::spawn_blocking(move || loader.load(user.as_deref())).await??;
        registry.check_data_sources(&self.data_sources)?;
        let registry = Arc::new(registry);

        let ctx = AgentContext::new(
            Arc::clone(&self.llm),
            Arc::clone(&registry),
            Arc::clone(&self.data_sources),
            self.config.default_model.clone(),
        );
        let agent: Arc<dyn CapabilityInvoker> = Arc::new(GenericAgent::new(ctx));
        let workflow = Workflow::new(agent, registry, self.config.workflow.clone());

        Ok(workflow
            .run_turn(user_input, conversation_history, user_details)
            .await)
    }
}

pub type ApiError = (StatusCode, Json<ErrorBody>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn missing_parameter(name: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: format!("Missing required parameter: {}", name),
            details: None,
        }),
    )
}

pub fn thread_not_found(thread_id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: format!("Unknown thread: {}", thread_id),
            details: None,
        }),
    )
}

pub fn internal_error(err: impl std::fmt::Display) -> ApiError {
    tracing::error!("Request failed: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: "An error occurred while processing the request.".to_string(),
            details: Some(err.to_string()),
        }),
    )
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/ask-ellis", post(ask_ellis))
        .route("/conv-history", post(conversations::conv_history))
        .route("/agents_list", get(agents_api::list_agents))
        .route("/enable_disable_agent", post(agents_api::enable_disable_agent))
        .route("/configure-agent", post(agents_api::configure_agent))
        .route("/fetch_agent_config", get(agents_api::fetch_agent_config))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let llm: Arc<dyn LlmClient> = Arc::new(OpenRouterClient::new(
        config.api_key.clone(),
        &config.llm_api_url,
    ));

    let data_sources = DataSources::load(&config.config_dir.join(DATA_SOURCES_FILE))?;

    // Fail fast on a broken registry instead of on the first request.
    let registry = RegistryLoader::new(config.config_dir.clone()).load(None)?;
    registry.check_data_sources(&data_sources)?;
    tracing::info!(
        agents = registry.agents().len(),
        aggregators = registry.explicit_agents().len(),
        "Capability registry validated"
    );

    let conversations =
        create_conversation_store(config.store_backend, config.database_path.clone())
            .await
            .map_err(anyhow::Error::msg)?;

    let state = Arc::new(AppState::new(config.clone(), llm, data_sources, conversations));
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        persistent_store: state.conversations.is_persistent(),
    })
}

/// Run one turn and persist it as a human/assistant exchange.
async fn ask_ellis(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AskRequest>,
) -> ApiResult<AskResponse> {
    let user_input = req.user_input.ok_or_else(|| missing_parameter("user_input"))?;
    let user_details = req
        .user_details
        .ok_or_else(|| missing_parameter("user_details"))?;

    let history = match &req.thread_id {
        Some(thread_id) => {
            let known = state
                .conversations
                .thread(thread_id)
                .await
                .map_err(internal_error)?;
            if known.is_none() {
                return Err(thread_not_found(thread_id));
            }
            let messages = state
                .conversations
                .messages(thread_id)
                .await
                .map_err(internal_error)?;
            history_text(&messages)
        }
        None => String::new(),
    };

    tracing::info!(thread_id = ?req.thread_id, "Processing ask request");
    let email = user_details.user_mail.clone().unwrap_or_default();
    let outcome = state
        .run_turn(&user_input, &history, user_details)
        .await
        .map_err(internal_error)?;

    // A thread is only created once its first turn has succeeded.
    let thread_id = match req.thread_id {
        Some(thread_id) => thread_id,
        None => {
            state
                .conversations
                .create_thread(&email, &short_name(&user_input))
                .await
                .map_err(internal_error)?
                .thread_id
        }
    };

    state
        .conversations
        .append_exchange(
            &thread_id,
            &user_input,
            &outcome.answer,
            outcome.input_tokens_count,
            outcome.output_tokens_count,
        )
        .await
        .map_err(internal_error)?;

    Ok(Json(AskResponse { thread_id, outcome }))
}
