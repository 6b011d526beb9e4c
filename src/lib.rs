//! Atelier: runtime layer for isolated coding agents
//!
//! Each agent gets its own workbench - a tmux session on a shared host, or a
//! container when the host can run them. The [`runtime::RuntimeManager`] picks
//! the strongest isolation the machine offers and hides the difference from
//! the workflow code driving the agents.

pub mod agent;
pub mod cli;
pub mod config;
pub mod container;
pub mod isolation;
pub mod runtime;
pub mod session;

use std::time::Duration;

use agent::AgentState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtelierError {
    #[error("Runtime unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Runtime manager is not initialized")]
    NotInitialized,

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Agent already exists: {0}")]
    AgentExists(String),

    #[error("Command in agent {agent_id} timed out after {timeout:?}")]
    Timeout { agent_id: String, timeout: Duration },

    #[error("Provisioning failed: {0}")]
    ProvisionFailure(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Agent {agent_id} is {state}")]
    InvalidState { agent_id: String, state: AgentState },

    #[error("Command cancelled: {0}")]
    Cancelled(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Teardown failed: {0}")]
    Teardown(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AtelierError>;
