//! # Ask Ellis
//!
//! Multi-agent orchestration service: a user question is decomposed into
//! dependent tasks, each task is answered by an LLM capability (optionally
//! backed by a database query), the results are validated with bounded
//! re-planning, and a summary is produced and persisted.
//!
//! ## Turn Flow
//!
//! ```text
//!   user input ──► Supervisor ──► tasks (dependency order) ──► Observer
//!                      ▲                                          │
//!                      └──────── re-plan with retry context ◄─────┤ invalid
//!                                                                 │
//!                    escalation (human review) ◄── retries spent ─┤
//!                                                                 │ valid / bypassed
//!                                                                 ▼
//!                                                           Aggregators
//! ```
//!
//! ## Modules
//! - `workflow`: dispatcher, validator state machine, aggregators, turn ledger
//! - `agents`: capability invocation through the LLM
//! - `capability`: capability definitions, output descriptors, prompt rendering
//! - `datasource`: query targets for query-backed capabilities
//! - `llm`: chat-completion client
//! - `api`: HTTP surface and conversation persistence

pub mod agents;
pub mod api;
pub mod capability;
pub mod config;
pub mod datasource;
pub mod llm;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use workflow::{TurnOutcome, Workflow};
