//! Agent table - tracks live sessions and team membership for a backend
//!
//! Every backend keeps one `AgentTable` and one `TeamTable`. The table owns
//! the pieces of agent state that are independent of the isolation mechanism:
//! id reservation, the lifecycle state, the per-agent command lock that keeps
//! commands in issue order, output history and the cancellation token that
//! lets `destroy_agent` win over an in-flight command.

use super::{
    AgentConfig, AgentLogger, AgentSession, AgentState, CommandResult, OutputTail, TeamWorkspace,
};
use crate::{AtelierError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// Default output history kept in memory per agent (16KB)
pub const DEFAULT_OUTPUT_CAPACITY: usize = 16 * 1024;

struct AgentEntry {
    config: AgentConfig,
    session: AgentSession,
    current_task: Option<String>,
    output: OutputTail,
    logger: Option<AgentLogger>,
    exec_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

impl AgentEntry {
    fn log(&mut self, message: &str) {
        if let Some(logger) = self.logger.as_mut() {
            if let Err(e) = logger.line(message) {
                tracing::warn!(agent_id = %self.session.agent_id, error = %e, "agent log write failed");
            }
        }
    }
}

/// Point-in-time view of an agent used for status reports
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub session: AgentSession,
    pub current_task: Option<String>,
    pub recent_logs: Vec<String>,
}

/// Live agents of one backend
pub struct AgentTable {
    entries: Mutex<HashMap<String, AgentEntry>>,
    output_capacity: usize,
}

impl AgentTable {
    pub fn new() -> Self {
        Self::with_output_capacity(DEFAULT_OUTPUT_CAPACITY)
    }

    pub fn with_output_capacity(output_capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            output_capacity,
        }
    }

    /// Claim an agent id before provisioning starts
    ///
    /// Fails if the id is already live or the backend is at `limit` agents.
    /// The request is kept so a reset can re-provision from it.
    pub async fn reserve(
        &self,
        config: &AgentConfig,
        session: AgentSession,
        limit: usize,
    ) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&session.agent_id) {
            return Err(AtelierError::AgentExists(session.agent_id));
        }
        if entries.len() >= limit {
            return Err(AtelierError::CapacityExceeded(format!(
                "{} agents already live (limit {})",
                entries.len(),
                limit
            )));
        }

        entries.insert(
            session.agent_id.clone(),
            AgentEntry {
                config: config.clone(),
                session,
                current_task: None,
                output: OutputTail::new(self.output_capacity),
                logger: None,
                exec_lock: Arc::new(Mutex::new(())),
                cancel: CancellationToken::new(),
            },
        );
        Ok(())
    }

    /// Open the agent's persistent log inside its workspace
    pub async fn attach_logger(&self, agent_id: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(agent_id)
            .ok_or_else(|| AtelierError::UnknownAgent(agent_id.to_string()))?;
        if entry.logger.is_none() {
            entry.logger = Some(AgentLogger::open(&entry.session.workspace_path)?);
        }
        Ok(())
    }

    /// Mark a provisioned agent as running
    pub async fn activate(&self, agent_id: &str) -> Result<AgentSession> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(agent_id)
            .ok_or_else(|| AtelierError::UnknownAgent(agent_id.to_string()))?;
        entry.session.state = AgentState::Running;
        entry.session.last_activity = Utc::now();
        entry.log("agent running");
        Ok(entry.session.clone())
    }

    /// Drop the agent from the table and cancel whatever it is running
    ///
    /// Returns `None` for ids that are not live.
    pub async fn release(&self, agent_id: &str) -> Option<AgentSession> {
        let mut entry = self.entries.lock().await.remove(agent_id)?;
        entry.cancel.cancel();
        entry.log("agent destroyed");
        entry.session.state = AgentState::Destroyed;
        Some(entry.session)
    }

    /// Cancel the agent's queued and running commands, keeping it registered
    ///
    /// Later commands get a fresh token, so a teardown that fails here can be
    /// retried without the agent being stuck cancelled.
    pub async fn cancel_commands(&self, agent_id: &str) -> Option<AgentSession> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(agent_id)?;
        std::mem::replace(&mut entry.cancel, CancellationToken::new()).cancel();
        Some(entry.session.clone())
    }

    /// Prepare an agent for re-provisioning under the same id
    ///
    /// Cancels in-flight commands and clears output history; the agent sits
    /// in `initializing` until `activate` is called again.
    pub async fn begin_reset(&self, agent_id: &str) -> Result<AgentSession> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(agent_id)
            .ok_or_else(|| AtelierError::UnknownAgent(agent_id.to_string()))?;
        entry.cancel.cancel();
        entry.cancel = CancellationToken::new();
        entry.output.clear();
        entry.current_task = None;
        entry.session.state = AgentState::Initializing;
        entry.log("agent reset");
        Ok(entry.session.clone())
    }

    pub async fn get(&self, agent_id: &str) -> Result<AgentSession> {
        self.entries
            .lock()
            .await
            .get(agent_id)
            .map(|e| e.session.clone())
            .ok_or_else(|| AtelierError::UnknownAgent(agent_id.to_string()))
    }

    /// The request the agent was created from
    pub async fn config(&self, agent_id: &str) -> Result<AgentConfig> {
        self.entries
            .lock()
            .await
            .get(agent_id)
            .map(|e| e.config.clone())
            .ok_or_else(|| AtelierError::UnknownAgent(agent_id.to_string()))
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.entries.lock().await.contains_key(agent_id)
    }

    pub async fn list(&self) -> Vec<AgentSession> {
        let mut sessions: Vec<AgentSession> = self
            .entries
            .lock()
            .await
            .values()
            .map(|e| e.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        sessions
    }

    pub async fn ids(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Move an agent along the state machine
    ///
    /// Same-state updates are no-ops; disallowed transitions are rejected.
    pub async fn set_state(&self, agent_id: &str, next: AgentState) -> Result<AgentSession> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(agent_id)
            .ok_or_else(|| AtelierError::UnknownAgent(agent_id.to_string()))?;
        let current = entry.session.state;
        if current != next {
            if !current.can_transition_to(next) {
                return Err(AtelierError::InvalidState {
                    agent_id: agent_id.to_string(),
                    state: current,
                });
            }
            entry.session.state = next;
            entry.log(&format!("state {} -> {}", current, next));
        }
        Ok(entry.session.clone())
    }

    pub async fn update_resources(
        &self,
        agent_id: &str,
        resources: super::ResourceSnapshot,
    ) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(agent_id)
            .ok_or_else(|| AtelierError::UnknownAgent(agent_id.to_string()))?;
        entry.session.resources = resources;
        Ok(())
    }

    pub async fn snapshot(&self, agent_id: &str, log_lines: usize) -> Result<AgentSnapshot> {
        let entries = self.entries.lock().await;
        let entry = entries
            .get(agent_id)
            .ok_or_else(|| AtelierError::UnknownAgent(agent_id.to_string()))?;
        Ok(AgentSnapshot {
            session: entry.session.clone(),
            current_task: entry.current_task.clone(),
            recent_logs: entry.output.tail_lines(log_lines),
        })
    }

    /// Wait for the agent's command slot and mark it working
    ///
    /// Commands for one agent run one at a time in the order callers asked
    /// for the slot; the returned ticket holds the slot until dropped.
    pub async fn begin_command(&self, agent_id: &str, command: &str) -> Result<CommandTicket> {
        let (lock, cancel) = {
            let entries = self.entries.lock().await;
            let entry = entries
                .get(agent_id)
                .ok_or_else(|| AtelierError::UnknownAgent(agent_id.to_string()))?;
            (entry.exec_lock.clone(), entry.cancel.clone())
        };

        let guard = tokio::select! {
            guard = lock.lock_owned() => guard,
            _ = cancel.cancelled() => {
                return Err(AtelierError::Cancelled(agent_id.to_string()));
            }
        };

        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(agent_id)
            .ok_or_else(|| AtelierError::UnknownAgent(agent_id.to_string()))?;
        if !entry.session.state.accepts_commands() {
            return Err(AtelierError::InvalidState {
                agent_id: agent_id.to_string(),
                state: entry.session.state,
            });
        }

        entry.session.state = AgentState::Working;
        entry.session.last_activity = Utc::now();
        entry.current_task = Some(command.to_string());
        entry.output.push(format!("$ {}\n", command).as_bytes());
        entry.log(&format!("$ {}", command));

        Ok(CommandTicket {
            agent_id: agent_id.to_string(),
            session_id: entry.session.session_id.clone(),
            workspace_path: entry.session.workspace_path.clone(),
            cancel: entry.cancel.clone(),
            _guard: guard,
        })
    }

    /// Record a command's outcome and release its slot
    pub async fn finish_command(&self, ticket: CommandTicket, outcome: &Result<CommandResult>) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&ticket.agent_id) else {
            return;
        };

        entry.current_task = None;
        entry.session.last_activity = Utc::now();

        match outcome {
            Ok(result) => {
                entry.output.push(result.stdout.as_bytes());
                entry.output.push(result.stderr.as_bytes());
                if let Some(logger) = entry.logger.as_mut() {
                    let written = logger
                        .write(result.stdout.as_bytes())
                        .and_then(|_| logger.write(result.stderr.as_bytes()));
                    if let Err(e) = written {
                        tracing::warn!(agent_id = %ticket.agent_id, error = %e, "agent log write failed");
                    }
                }
                entry.log(&format!(
                    "exit {} in {}ms",
                    result.exit_code,
                    result.duration.as_millis()
                ));
            }
            Err(e) => {
                entry.output.push(format!("! {}\n", e).as_bytes());
                entry.log(&format!("! {}", e));
            }
        }

        // A reset or destroy may have moved the agent on already
        if entry.session.state == AgentState::Working {
            entry.session.state = match outcome {
                Err(AtelierError::CommandFailed(_)) => AgentState::Error,
                _ => AgentState::Idle,
            };
        }
        drop(ticket);
    }
}

impl Default for AgentTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive right to run one command in an agent
pub struct CommandTicket {
    pub agent_id: String,
    pub session_id: String,
    pub workspace_path: PathBuf,
    cancel: CancellationToken,
    _guard: OwnedMutexGuard<()>,
}

impl CommandTicket {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive a command future under the caller's timeout
    ///
    /// Destruction of the agent wins over both the command and the timeout.
    pub async fn run<F>(&self, timeout: Option<Duration>, command: F) -> Result<CommandResult>
    where
        F: Future<Output = Result<CommandResult>>,
    {
        let bounded = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, command).await {
                    Ok(result) => result,
                    Err(_) => Err(AtelierError::Timeout {
                        agent_id: self.agent_id.clone(),
                        timeout: limit,
                    }),
                },
                None => command.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AtelierError::Cancelled(self.agent_id.clone())),
            result = bounded => result,
        }
    }
}

/// Team workspaces of one backend
pub struct TeamTable {
    teams: Mutex<HashMap<String, TeamWorkspace>>,
}

impl TeamTable {
    pub fn new() -> Self {
        Self {
            teams: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, team_id: &str) -> Option<TeamWorkspace> {
        self.teams.lock().await.get(team_id).cloned()
    }

    /// Store `workspace` unless the team already exists
    ///
    /// Returns the stored team and whether this call inserted it.
    pub async fn insert_if_absent(&self, workspace: TeamWorkspace) -> (TeamWorkspace, bool) {
        let mut teams = self.teams.lock().await;
        if let Some(existing) = teams.get(&workspace.team_id) {
            return (existing.clone(), false);
        }
        teams.insert(workspace.team_id.clone(), workspace.clone());
        (workspace, true)
    }

    pub async fn add_member(&self, team_id: &str, agent_id: &str) -> bool {
        match self.teams.lock().await.get_mut(team_id) {
            Some(team) => team.agents.insert(agent_id.to_string()),
            None => false,
        }
    }

    pub async fn remove_member(&self, team_id: &str, agent_id: &str) {
        if let Some(team) = self.teams.lock().await.get_mut(team_id) {
            team.agents.remove(agent_id);
        }
    }

    pub async fn remove(&self, team_id: &str) -> Option<TeamWorkspace> {
        self.teams.lock().await.remove(team_id)
    }

    pub async fn list(&self) -> Vec<TeamWorkspace> {
        self.teams.lock().await.values().cloned().collect()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.teams.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.teams.lock().await.len()
    }
}

impl Default for TeamTable {
    fn default() -> Self {
        Self::new()
    }
}
