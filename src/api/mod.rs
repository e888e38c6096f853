//! HTTP API for Ask Ellis.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /ask-ellis` - Run one turn and persist it
//! - `POST /conv-history` - Threads, messages and feedback (`func_name` dispatch)
//! - `GET /agents_list` - Task capabilities with their enable flags
//! - `POST /enable_disable_agent` - Enable or disable a capability for a user
//! - `POST /configure-agent` - Save a per-user capability override
//! - `GET /fetch_agent_config` - Effective capability definition

mod agents;
pub mod conversation_store;
mod conversations;
mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
