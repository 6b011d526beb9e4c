//! Agent data model
//!
//! Requests, live session handles and the results passed between callers and
//! runtime backends.

mod buffer;
mod logger;
mod registry;

pub use buffer::OutputTail;
pub use logger::{AgentLogger, AGENT_LOG_FILE};
pub use registry::*;

use crate::runtime::RuntimeKind;
use crate::{AtelierError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Team every agent joins unless the request names another one.
pub const DEFAULT_TEAM: &str = "default";

fn default_team() -> String {
    DEFAULT_TEAM.to_string()
}

/// Names end up in tmux session names, container names and host paths.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Request to create an agent
///
/// Opaque to the runtime beyond the fields below; archetype-specific meaning
/// belongs to whoever builds the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Archetype tag (role name); also the container pool key
    pub agent_type: String,
    /// Caller-supplied unique key
    pub agent_id: String,
    #[serde(default = "default_team")]
    pub team_id: String,
    /// Enabled capability tags
    #[serde(default)]
    pub tools: BTreeSet<String>,
    /// Docker-style size (`512m`, `2g`)
    #[serde(default)]
    pub memory_limit: Option<String>,
    /// CPU cores
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Container image; ignored by the tmux backend
    #[serde(default)]
    pub base_image: Option<String>,
    /// Informational list of tools the agent expects
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Host directory copied into the workspace before the agent starts
    #[serde(default)]
    pub project_path: Option<PathBuf>,
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            agent_id: agent_id.into(),
            team_id: default_team(),
            tools: BTreeSet::new(),
            memory_limit: None,
            cpu_limit: None,
            environment: BTreeMap::new(),
            base_image: None,
            dependencies: Vec::new(),
            project_path: None,
        }
    }

    pub fn with_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = team_id.into();
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.insert(tool.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.base_image = Some(image.into());
        self
    }

    pub fn with_limits(mut self, memory: Option<&str>, cpu: Option<f64>) -> Self {
        self.memory_limit = memory.map(str::to_string);
        self.cpu_limit = cpu;
        self
    }

    pub fn with_project(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    /// Reject ids that cannot be used as session, container or directory names
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("agent_id", &self.agent_id),
            ("agent_type", &self.agent_type),
            ("team_id", &self.team_id),
        ] {
            if !is_valid_name(value) {
                return Err(AtelierError::ProvisionFailure(format!(
                    "invalid {} '{}'",
                    field, value
                )));
            }
        }
        if let Some(cpu) = self.cpu_limit {
            if cpu.is_nan() || cpu <= 0.0 {
                return Err(AtelierError::ProvisionFailure(format!(
                    "invalid cpu_limit {}",
                    cpu
                )));
            }
        }
        Ok(())
    }

    /// Baseline identity variables followed by the caller's environment
    pub fn identity_env(&self) -> Vec<(String, String)> {
        let tools: Vec<&str> = self.tools.iter().map(String::as_str).collect();
        let mut env = vec![
            ("AGENT_ID".to_string(), self.agent_id.clone()),
            ("AGENT_TYPE".to_string(), self.agent_type.clone()),
            ("TEAM_ID".to_string(), self.team_id.clone()),
            ("AGENT_TOOLS".to_string(), tools.join(",")),
        ];
        env.extend(
            self.environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env
    }
}

/// Lifecycle state of an agent session
///
/// `initializing → running → (working ⇄ idle) → completed | error`, with
/// `destroyed` reachable from anywhere. `error` only leaves via a reset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Initializing,
    Running,
    Working,
    Idle,
    Completed,
    Error,
    Destroyed,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Initializing => "initializing",
            AgentState::Running => "running",
            AgentState::Working => "working",
            AgentState::Idle => "idle",
            AgentState::Completed => "completed",
            AgentState::Error => "error",
            AgentState::Destroyed => "destroyed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentState::Completed | AgentState::Error | AgentState::Destroyed
        )
    }

    pub fn accepts_commands(self) -> bool {
        matches!(self, AgentState::Running | AgentState::Idle)
    }

    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Initializing, Running | Error) => true,
            (Running | Idle, Working) => true,
            (Working, Idle | Error) => true,
            (Running | Working | Idle, Completed | Error) => true,
            // reset
            (Error | Completed, Running) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Best-effort resource usage; unknown values stay `None`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: Option<f64>,
    pub memory_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
}

/// Live handle to a provisioned agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub agent_id: String,
    pub agent_type: String,
    pub team_id: String,
    pub state: AgentState,
    pub runtime: RuntimeKind,
    /// tmux session name or container name
    pub session_id: String,
    /// Host directory holding `output/`, `handoffs/` and `state/`
    pub workspace_path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub resources: ResourceSnapshot,
    /// Advisory for tmux, enforced for containers
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<f64>,
}

impl AgentSession {
    pub fn new(
        config: &AgentConfig,
        runtime: RuntimeKind,
        session_id: String,
        workspace_path: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            agent_id: config.agent_id.clone(),
            agent_type: config.agent_type.clone(),
            team_id: config.team_id.clone(),
            state: AgentState::Initializing,
            runtime,
            session_id,
            workspace_path,
            start_time: now,
            last_activity: now,
            resources: ResourceSnapshot::default(),
            memory_limit: config.memory_limit.clone(),
            cpu_limit: config.cpu_limit,
        }
    }
}

/// Identity stamped into `state/identity.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_type: String,
    pub team_id: String,
    pub runtime: RuntimeKind,
    pub tools: BTreeSet<String>,
    pub dependencies: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentIdentity {
    pub fn new(config: &AgentConfig, runtime: RuntimeKind) -> Self {
        Self {
            agent_id: config.agent_id.clone(),
            agent_type: config.agent_type.clone(),
            team_id: config.team_id.clone(),
            runtime,
            tools: config.tools.clone(),
            dependencies: config.dependencies.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Options for a single command execution
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Upper bound on execution; no bound when unset
    pub timeout: Option<Duration>,
    /// Directory relative to the agent workspace
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

/// Complete outcome of one command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Snapshot returned by status polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub state: AgentState,
    /// Command currently running, if any
    pub current_task: Option<String>,
    pub resources: ResourceSnapshot,
    pub recent_logs: Vec<String>,
    /// Workspace files relative to the workspace root
    pub files: Vec<String>,
    pub last_activity: DateTime<Utc>,
}

/// Options for creating a team workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Provision a shared storage volume (container backend)
    #[serde(default = "default_true")]
    pub shared_volume: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            shared_volume: true,
        }
    }
}

/// Group of agents sharing a workspace root and a handoff directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamWorkspace {
    pub team_id: String,
    pub workspace_path: PathBuf,
    pub shared_path: PathBuf,
    pub agents: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    /// Shared storage volume (container backend only)
    pub volume: Option<String>,
}

/// Non-fatal post-provision failure; the agent works with a degraded setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationWarning {
    pub step: String,
    pub message: String,
}

impl ConfigurationWarning {
    pub fn new(step: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self {
            step: step.into(),
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for ConfigurationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}

/// A freshly created agent with any configuration warnings collected on the way
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub session: AgentSession,
    pub warnings: Vec<ConfigurationWarning>,
    /// Whether a pre-warmed instance was claimed
    pub pooled: bool,
}

/// Per-file outcome of a handoff between two agents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferReport {
    pub copied: Vec<String>,
    pub failed: Vec<TransferFailure>,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferFailure {
    pub file: String,
    pub reason: String,
}
