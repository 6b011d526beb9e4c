//! Agent runtime abstraction
//!
//! A [`RuntimeBackend`] is one way of isolating agents (tmux sessions,
//! containers). The [`RuntimeRegistry`] knows every compiled-in backend and
//! which of them work on this host, the [`RuntimeSelector`] decides which one
//! is active, and the [`RuntimeManager`] routes lifecycle calls to it.

mod events;
mod manager;
mod registry;
mod selector;

#[cfg(test)]
pub(crate) mod fake;

pub use events::{EventBus, RuntimeEvent};
pub use manager::{HealthReport, ManagerStats, RuntimeManager};
pub use registry::RuntimeRegistry;
pub use selector::RuntimeSelector;

use crate::agent::{
    AgentConfig, AgentSession, AgentStatus, CommandResult, ExecOptions, Provisioned, TeamConfig,
    TeamWorkspace, TransferReport,
};
use crate::{AtelierError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Compiled-in isolation backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// One container per agent
    Container,
    /// One tmux session per agent
    Tmux,
}

impl RuntimeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeKind::Container => "container",
            RuntimeKind::Tmux => "tmux",
        }
    }

    /// Strongest isolation first
    pub fn default_chain() -> Vec<RuntimeKind> {
        vec![RuntimeKind::Container, RuntimeKind::Tmux]
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = AtelierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container" | "docker" | "podman" => Ok(RuntimeKind::Container),
            "tmux" | "multiplexed" | "session" => Ok(RuntimeKind::Tmux),
            other => Err(AtelierError::Config(format!("unknown runtime '{}'", other))),
        }
    }
}

/// Which backend the caller would like to run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RuntimePreference {
    /// First available entry of the fallback chain
    #[default]
    Auto,
    /// A specific backend, falling back to `Auto` when it is unavailable
    Explicit(RuntimeKind),
}

impl FromStr for RuntimePreference {
    type Err = AtelierError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(RuntimePreference::Auto)
        } else {
            s.parse().map(RuntimePreference::Explicit)
        }
    }
}

impl TryFrom<String> for RuntimePreference {
    type Error = AtelierError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RuntimePreference> for String {
    fn from(value: RuntimePreference) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for RuntimePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimePreference::Auto => write!(f, "auto"),
            RuntimePreference::Explicit(kind) => write!(f, "{}", kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Separate process group on the shared host
    Process,
    /// Separate kernel namespaces and cgroups
    Container,
}

/// Static description of what a backend can guarantee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub isolation_level: IsolationLevel,
    pub has_hard_resource_limits: bool,
    pub supports_network_isolation: bool,
    pub supports_persistence: bool,
    pub max_concurrent_agents: usize,
}

/// Point-in-time counters of a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStats {
    pub runtime: RuntimeKind,
    pub initialized: bool,
    pub active_agents: usize,
    pub agents_by_state: BTreeMap<String, usize>,
    pub teams: usize,
    pub pooled_instances: usize,
    pub commands_executed: u64,
    pub max_concurrent_agents: usize,
}

/// One isolation strategy
///
/// Backends own every agent they create. Lifecycle calls must be safe to
/// issue concurrently for different agents; commands for the same agent run
/// in issue order.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    fn capabilities(&self) -> Capabilities;

    /// Non-destructive probe. `Ok(false)` means "not usable here"; an error
    /// means the probe itself broke and is treated the same way by callers.
    async fn check_availability(&self) -> Result<bool>;

    /// One-time setup; calling again after success is a no-op
    async fn initialize(&self) -> Result<()>;

    async fn create_agent(&self, config: AgentConfig) -> Result<Provisioned>;

    async fn execute_command(
        &self,
        agent_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandResult>;

    /// Copy `<from>/output/<file>` into `<to>/handoffs/<file>`
    async fn transfer_files(
        &self,
        from_agent: &str,
        to_agent: &str,
        files: &[String],
    ) -> Result<TransferReport>;

    async fn get_agent_status(&self, agent_id: &str) -> Result<AgentStatus>;

    async fn list_agents(&self) -> Vec<AgentSession>;

    /// Unknown or already destroyed ids succeed with a warning
    async fn destroy_agent(&self, agent_id: &str) -> Result<()>;

    /// Re-provision the environment under the same id
    async fn reset_agent(&self, agent_id: &str) -> Result<AgentSession>;

    async fn create_team_workspace(
        &self,
        team_id: &str,
        config: TeamConfig,
    ) -> Result<TeamWorkspace>;

    /// Members are destroyed before shared storage goes away
    async fn destroy_team_workspace(&self, team_id: &str) -> Result<()>;

    async fn stats(&self) -> BackendStats;

    /// Release every resource the backend holds; it stays initialized
    async fn cleanup(&self) -> Result<()>;

    /// `cleanup` plus stopping background work; `initialize` may be called again
    async fn shutdown(&self) -> Result<()>;
}
