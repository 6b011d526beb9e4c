//! State and host-side steps shared by the runtime backends
//!
//! A `Workshop` bundles the workspace layout, the agent and team tables and
//! the event bus. Backends add their isolation mechanism on top; everything
//! that only touches host directories lives here so both backends behave the
//! same way for transfers, status reports and team bookkeeping.

use super::{
    create_agent_dirs, disk_usage, list_files, transfer_files, write_identity, WorkspaceLayout,
};
use crate::agent::{
    AgentConfig, AgentIdentity, AgentSession, AgentStatus, AgentTable, CommandResult,
    ConfigurationWarning, ResourceSnapshot, TeamTable, TeamWorkspace, TransferReport,
};
use crate::runtime::{BackendStats, EventBus, RuntimeEvent, RuntimeKind};
use crate::{AtelierError, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, MutexGuard};

pub struct Workshop {
    pub kind: RuntimeKind,
    pub layout: WorkspaceLayout,
    pub agents: AgentTable,
    pub teams: TeamTable,
    pub events: EventBus,
    log_tail_lines: usize,
    commands_executed: AtomicU64,
    initialized: Mutex<bool>,
}

impl Workshop {
    pub fn new(
        kind: RuntimeKind,
        layout: WorkspaceLayout,
        events: EventBus,
        log_tail_lines: usize,
    ) -> Self {
        Self {
            kind,
            layout,
            agents: AgentTable::new(),
            teams: TeamTable::new(),
            events,
            log_tail_lines,
            commands_executed: AtomicU64::new(0),
            initialized: Mutex::new(false),
        }
    }

    /// Held for the whole of `initialize`/`shutdown` so they never interleave
    pub async fn init_guard(&self) -> MutexGuard<'_, bool> {
        self.initialized.lock().await
    }

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.lock().await
    }

    pub async fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized().await {
            Ok(())
        } else {
            Err(AtelierError::NotInitialized)
        }
    }

    /// Create the team directories and record the team
    ///
    /// Returns the stored team and whether this call created it.
    pub async fn register_team(
        &self,
        team_id: &str,
        volume: Option<String>,
    ) -> Result<(TeamWorkspace, bool)> {
        if let Some(existing) = self.teams.get(team_id).await {
            return Ok((existing, false));
        }
        let (workspace_path, shared_path) = self.layout.prepare_team(team_id).await?;
        let (stored, created) = self
            .teams
            .insert_if_absent(TeamWorkspace {
                team_id: team_id.to_string(),
                workspace_path,
                shared_path,
                agents: Default::default(),
                created_at: Utc::now(),
                volume,
            })
            .await;

        if created {
            tracing::info!(runtime = %self.kind, team_id, "Team workspace created");
            self.events.emit(RuntimeEvent::TeamCreated {
                team_id: team_id.to_string(),
            });
        }
        Ok((stored, created))
    }

    /// Every live agent belonging to the team
    pub async fn team_members(&self, team_id: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .agents
            .list()
            .await
            .into_iter()
            .filter(|s| s.team_id == team_id)
            .map(|s| s.agent_id)
            .collect();
        if let Some(team) = self.teams.get(team_id).await {
            for id in team.agents {
                if !members.contains(&id) {
                    members.push(id);
                }
            }
        }
        members
    }

    /// Drop the team record and its shared directory; members must be gone
    pub async fn remove_team(&self, team_id: &str) -> Result<()> {
        let shared = self.layout.shared_dir(team_id);
        match tokio::fs::remove_dir_all(&shared).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(AtelierError::Teardown(format!(
                    "removing {}: {}",
                    shared.display(),
                    e
                )))
            }
        }
        self.teams.remove(team_id).await;
        tracing::info!(runtime = %self.kind, team_id, "Team workspace destroyed");
        self.events.emit(RuntimeEvent::TeamDestroyed {
            team_id: team_id.to_string(),
        });
        Ok(())
    }

    /// Host directory for a new agent, seeded from the project path
    pub async fn prepare_workspace(&self, config: &AgentConfig) -> Result<PathBuf> {
        self.layout
            .prepare_agent(
                &config.team_id,
                &config.agent_id,
                config.project_path.as_deref(),
            )
            .await
            .map_err(|e| match e {
                AtelierError::ProvisionFailure(_) => e,
                other => AtelierError::ProvisionFailure(format!(
                    "workspace for {}: {}",
                    config.agent_id, other
                )),
            })
    }

    /// Host-side post-provision steps; failures become warnings
    pub async fn configure_workspace(
        &self,
        config: &AgentConfig,
        workspace: &Path,
        warnings: &mut Vec<ConfigurationWarning>,
    ) {
        if let Err(e) = create_agent_dirs(workspace).await {
            warnings.push(ConfigurationWarning::new("layout", e));
        }
        let identity = AgentIdentity::new(config, self.kind);
        if let Err(e) = write_identity(workspace, &identity).await {
            warnings.push(ConfigurationWarning::new("identity", e));
        }
        if let Err(e) = self.agents.attach_logger(&config.agent_id).await {
            warnings.push(ConfigurationWarning::new("logger", e));
        }
    }

    /// Mark the agent running and announce it
    pub async fn finish_create(
        &self,
        config: &AgentConfig,
        pooled: bool,
        warnings: &[ConfigurationWarning],
    ) -> Result<AgentSession> {
        let session = self.agents.activate(&config.agent_id).await?;
        self.teams.add_member(&config.team_id, &config.agent_id).await;

        for warning in warnings {
            tracing::warn!(
                agent_id = %config.agent_id,
                %warning,
                "agent configured with degraded setup"
            );
        }
        tracing::info!(
            runtime = %self.kind,
            agent_id = %config.agent_id,
            team_id = %config.team_id,
            pooled,
            "Agent created"
        );
        self.events.emit(RuntimeEvent::AgentCreated {
            agent_id: config.agent_id.clone(),
            team_id: config.team_id.clone(),
            runtime: self.kind,
            pooled,
            warnings: warnings.len(),
        });
        Ok(session)
    }

    /// Account for a finished command and publish its outcome
    pub fn record_command(&self, agent_id: &str, outcome: &Result<CommandResult>) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(result) => {
                tracing::debug!(agent_id, exit_code = result.exit_code, "command finished");
                self.events.emit(RuntimeEvent::CommandExecuted {
                    agent_id: agent_id.to_string(),
                    exit_code: result.exit_code,
                    duration_ms: result.duration.as_millis() as u64,
                });
            }
            Err(AtelierError::Timeout { timeout, .. }) => {
                tracing::warn!(agent_id, ?timeout, "command timed out");
                self.events.emit(RuntimeEvent::CommandTimedOut {
                    agent_id: agent_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            Err(e) => {
                tracing::warn!(agent_id, error = %e, "command did not complete");
            }
        }
    }

    pub async fn transfer(&self, from: &str, to: &str, files: &[String]) -> Result<TransferReport> {
        let source = self.agents.get(from).await?;
        let target = self.agents.get(to).await?;

        let report = transfer_files(&source.workspace_path, &target.workspace_path, files).await;
        tracing::info!(
            from,
            to,
            copied = report.copied.len(),
            failed = report.failed.len(),
            "Files transferred"
        );
        self.events.emit(RuntimeEvent::FilesTransferred {
            from: from.to_string(),
            to: to.to_string(),
            copied: report.copied.len(),
            failed: report.failed.len(),
        });
        Ok(report)
    }

    /// Assemble a status report; `resources` comes from the backend's probe
    pub async fn status(
        &self,
        agent_id: &str,
        mut resources: ResourceSnapshot,
    ) -> Result<AgentStatus> {
        let workspace = self.agents.get(agent_id).await?.workspace_path;
        resources.disk_bytes = Some(disk_usage(&workspace).await);
        self.agents.update_resources(agent_id, resources.clone()).await?;

        let files = list_files(&workspace).await.unwrap_or_else(|e| {
            tracing::debug!(agent_id, error = %e, "workspace listing failed");
            Vec::new()
        });
        let snapshot = self.agents.snapshot(agent_id, self.log_tail_lines).await?;

        Ok(AgentStatus {
            agent_id: agent_id.to_string(),
            state: snapshot.session.state,
            current_task: snapshot.current_task,
            resources,
            recent_logs: snapshot.recent_logs,
            files,
            last_activity: snapshot.session.last_activity,
        })
    }

    pub async fn stats(&self, pooled_instances: usize, max_agents: usize) -> BackendStats {
        let sessions = self.agents.list().await;
        let mut agents_by_state = BTreeMap::new();
        for session in &sessions {
            *agents_by_state
                .entry(session.state.as_str().to_string())
                .or_insert(0) += 1;
        }
        BackendStats {
            runtime: self.kind,
            initialized: self.is_initialized().await,
            active_agents: sessions.len(),
            agents_by_state,
            teams: self.teams.len().await,
            pooled_instances,
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            max_concurrent_agents: max_agents,
        }
    }
}
