//! Multiplexed-session backend
//!
//! One tmux session per agent, rooted at the agent's host workspace. Agents
//! share the host kernel, so resource limits are recorded but not enforced.
//! Commands are typed into the session between sentinel lines and the pane is
//! captured until the closing sentinel reports the exit status.

mod frame;
mod tmux;

#[cfg(test)]
pub(crate) mod fake;

pub use frame::{shell_quote, CommandFrame};
pub use tmux::{Multiplexer, TmuxCli};

use crate::agent::{
    AgentConfig, AgentSession, AgentState, AgentStatus, CommandResult, ExecOptions, Provisioned,
    ResourceSnapshot, TeamConfig, TeamWorkspace, TransferReport,
};
use crate::config::{RuntimeConfig, TmuxSettings};
use crate::isolation::{WorkspaceLayout, Workshop};
use crate::runtime::{
    BackendStats, Capabilities, EventBus, IsolationLevel, RuntimeBackend, RuntimeEvent,
    RuntimeKind,
};
use crate::{AtelierError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Session variable naming the root that owns the session
const ROOT_VAR: &str = "ATELIER_SESSION_ROOT";

pub struct MultiplexedBackend {
    mux: Arc<dyn Multiplexer>,
    shop: Workshop,
    settings: TmuxSettings,
    seq: AtomicU64,
}

impl MultiplexedBackend {
    pub fn new(config: &RuntimeConfig, events: EventBus) -> Self {
        let mux = Arc::new(TmuxCli::new(config.tmux.binary.clone()));
        Self::with_multiplexer(config, events, mux)
    }

    pub fn with_multiplexer(
        config: &RuntimeConfig,
        events: EventBus,
        mux: Arc<dyn Multiplexer>,
    ) -> Self {
        Self {
            mux,
            shop: Workshop::new(
                RuntimeKind::Tmux,
                WorkspaceLayout::new(&config.root_dir),
                events,
                config.log_tail_lines,
            ),
            settings: config.tmux.clone(),
            seq: AtomicU64::new(1),
        }
    }

    fn session_name(&self, agent_id: &str) -> String {
        format!("{}{}", self.settings.session_prefix, agent_id)
    }

    fn events(&self) -> &EventBus {
        &self.shop.events
    }

    fn root_tag(&self) -> String {
        self.shop.layout.root().to_string_lossy().into_owned()
    }

    /// Kill sessions started under this root that no live agent owns
    ///
    /// Catches sessions left behind by a previous process that died without
    /// shutting down. Sessions of other roots are left alone.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let live = self.shop.agents.list().await;
        let root = self.root_tag();
        let candidates: Vec<String> = self
            .mux
            .list_sessions()
            .await?
            .into_iter()
            .filter(|name| name.starts_with(&self.settings.session_prefix))
            .filter(|name| !live.iter().any(|s| &s.session_id == name))
            .collect();

        let mut orphans = Vec::with_capacity(candidates.len());
        for name in candidates {
            match self.mux.session_var(&name, ROOT_VAR).await {
                Ok(Some(owner)) if owner == root => orphans.push(name),
                Ok(owner) => {
                    tracing::debug!(session = %name, ?owner, "session belongs to another root")
                }
                Err(e) => tracing::debug!(session = %name, error = %e, "session owner unknown"),
            }
        }

        let mut handles = Vec::with_capacity(orphans.len());
        for name in orphans {
            let mux = self.mux.clone();
            handles.push(tokio::spawn(async move {
                let result = mux.kill_session(&name).await;
                (name, result)
            }));
        }

        let mut killed = 0;
        for handle in handles {
            match handle.await {
                Ok((name, Ok(()))) => {
                    tracing::info!(session = %name, "Killed orphaned session");
                    killed += 1;
                }
                Ok((name, Err(e))) => {
                    tracing::warn!(session = %name, error = %e, "failed to kill orphaned session")
                }
                Err(e) => tracing::warn!(error = %e, "orphan sweep task failed"),
            }
        }
        Ok(killed)
    }

    /// Workspace plus session; anything failing here aborts creation
    async fn provision(&self, config: &AgentConfig, name: &str) -> Result<()> {
        let workspace = self.shop.prepare_workspace(config).await?;
        self.start_session(config, name, &workspace).await
    }

    async fn start_session(&self, config: &AgentConfig, name: &str, workspace: &Path) -> Result<()> {
        // A session with this name outlived its agent
        if self.mux.has_session(name).await.unwrap_or(false) {
            tracing::warn!(session = %name, "replacing stale session");
            self.mux.kill_session(name).await?;
        }
        let mut env = config.identity_env();
        env.push((ROOT_VAR.to_string(), self.root_tag()));
        self.mux
            .new_session(name, workspace, &env)
            .await
            .map_err(|e| {
                AtelierError::ProvisionFailure(format!("tmux session {}: {}", name, e))
            })
    }

    async fn run_framed(
        &self,
        session: &str,
        script: String,
        frame: CommandFrame,
    ) -> Result<CommandResult> {
        let started = Instant::now();
        self.mux.send_line(session, &script).await?;

        let poll = self.settings.poll_interval();
        loop {
            tokio::time::sleep(poll).await;
            let captured = self.mux.capture(session, self.settings.history_lines).await?;
            if let Some((stdout, exit_code)) = frame.parse(&captured) {
                return Ok(CommandResult {
                    stdout,
                    // merged into the terminal stream
                    stderr: String::new(),
                    exit_code,
                    duration: started.elapsed(),
                    timestamp: Utc::now(),
                });
            }
        }
    }
}

#[async_trait]
impl RuntimeBackend for MultiplexedBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Tmux
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            isolation_level: IsolationLevel::Process,
            has_hard_resource_limits: false,
            supports_network_isolation: false,
            supports_persistence: true,
            max_concurrent_agents: self.settings.max_agents,
        }
    }

    async fn check_availability(&self) -> Result<bool> {
        Ok(self.mux.version().await?.is_some())
    }

    async fn initialize(&self) -> Result<()> {
        let mut initialized = self.shop.init_guard().await;
        if *initialized {
            return Ok(());
        }
        let version = self.mux.version().await?.ok_or_else(|| {
            AtelierError::BackendUnavailable(format!("{} is not usable", self.settings.binary))
        })?;
        self.shop.layout.prepare_root().await?;

        match self.sweep_orphans().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(sessions = n, "Removed sessions from a previous run"),
            Err(e) => tracing::warn!(error = %e, "orphan sweep failed"),
        }

        *initialized = true;
        tracing::info!(%version, root = ?self.shop.layout.root(), "tmux runtime initialized");
        Ok(())
    }

    async fn create_agent(&self, config: AgentConfig) -> Result<Provisioned> {
        self.shop.ensure_initialized().await?;
        config.validate()?;
        self.shop.register_team(&config.team_id, None).await?;

        let name = self.session_name(&config.agent_id);
        let workspace = self
            .shop
            .layout
            .agent_dir(&config.team_id, &config.agent_id);
        let session = AgentSession::new(&config, RuntimeKind::Tmux, name.clone(), workspace.clone());
        self.shop
            .agents
            .reserve(&config, session, self.settings.max_agents)
            .await?;

        if let Err(e) = self.provision(&config, &name).await {
            tracing::error!(agent_id = %config.agent_id, error = %e, "provisioning failed");
            self.shop.agents.release(&config.agent_id).await;
            if let Err(cleanup) = self.mux.kill_session(&name).await {
                tracing::warn!(session = %name, error = %cleanup, "cleanup after failed provision");
            }
            return Err(e);
        }

        let mut warnings = Vec::new();
        self.shop
            .configure_workspace(&config, &workspace, &mut warnings)
            .await;
        let session = self.shop.finish_create(&config, false, &warnings).await?;

        Ok(Provisioned {
            session,
            warnings,
            pooled: false,
        })
    }

    async fn execute_command(
        &self,
        agent_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandResult> {
        let ticket = self.shop.agents.begin_command(agent_id, command).await?;

        let frame = CommandFrame::new(self.seq.fetch_add(1, Ordering::Relaxed));
        let workdir = options
            .workdir
            .as_deref()
            .map(|dir| {
                let dir = dir.trim_start_matches('/');
                ticket.workspace_path.join(dir).to_string_lossy().into_owned()
            });
        let script = frame.script(command, workdir.as_deref(), &options.env);

        let outcome = ticket
            .run(
                options.timeout,
                self.run_framed(&ticket.session_id, script, frame),
            )
            .await;

        if matches!(outcome, Err(AtelierError::Timeout { .. })) {
            // Return the shell to its prompt for the next command
            if let Err(e) = self.mux.interrupt(&ticket.session_id).await {
                tracing::warn!(agent_id, error = %e, "interrupt after timeout failed");
            }
        }

        self.shop.record_command(agent_id, &outcome);
        self.shop.agents.finish_command(ticket, &outcome).await;
        outcome
    }

    async fn transfer_files(
        &self,
        from_agent: &str,
        to_agent: &str,
        files: &[String],
    ) -> Result<TransferReport> {
        self.shop.transfer(from_agent, to_agent, files).await
    }

    async fn get_agent_status(&self, agent_id: &str) -> Result<AgentStatus> {
        let session = self.shop.agents.get(agent_id).await?;

        let polls_session = !session.state.is_terminal() && session.state != AgentState::Initializing;
        if polls_session {
            match self.mux.has_session(&session.session_id).await {
                Ok(false) => {
                    tracing::warn!(agent_id, session = %session.session_id, "session vanished");
                    self.shop.agents.set_state(agent_id, AgentState::Error).await?;
                }
                Ok(true) => {}
                Err(e) => tracing::warn!(agent_id, error = %e, "session probe failed"),
            }
        }

        self.shop.status(agent_id, ResourceSnapshot::default()).await
    }

    async fn list_agents(&self) -> Vec<AgentSession> {
        self.shop.agents.list().await
    }

    async fn destroy_agent(&self, agent_id: &str) -> Result<()> {
        let Some(session) = self.shop.agents.cancel_commands(agent_id).await else {
            tracing::warn!(agent_id, "destroy requested for unknown agent");
            return Ok(());
        };
        // The agent stays registered until its session is gone
        if let Err(e) = self.mux.kill_session(&session.session_id).await {
            tracing::warn!(agent_id, session = %session.session_id, error = %e, "session kill failed");
            return Err(e);
        }
        let Some(session) = self.shop.agents.release(agent_id).await else {
            // a concurrent destroy finished first
            return Ok(());
        };
        self.shop
            .teams
            .remove_member(&session.team_id, agent_id)
            .await;

        tracing::info!(agent_id, session = %session.session_id, "Agent destroyed");
        self.events().emit(RuntimeEvent::AgentDestroyed {
            agent_id: agent_id.to_string(),
            team_id: session.team_id,
        });
        Ok(())
    }

    async fn reset_agent(&self, agent_id: &str) -> Result<AgentSession> {
        let config = self.shop.agents.config(agent_id).await?;
        let session = self.shop.agents.begin_reset(agent_id).await?;

        self.mux.kill_session(&session.session_id).await?;
        if let Err(e) = self
            .start_session(&config, &session.session_id, &session.workspace_path)
            .await
        {
            self.shop.agents.set_state(agent_id, AgentState::Error).await?;
            return Err(e);
        }

        let session = self.shop.agents.activate(agent_id).await?;
        tracing::info!(agent_id, "Agent reset");
        self.events().emit(RuntimeEvent::AgentReset {
            agent_id: agent_id.to_string(),
        });
        Ok(session)
    }

    async fn create_team_workspace(
        &self,
        team_id: &str,
        _config: TeamConfig,
    ) -> Result<TeamWorkspace> {
        self.shop.ensure_initialized().await?;
        if !crate::agent::is_valid_name(team_id) {
            return Err(AtelierError::ProvisionFailure(format!(
                "invalid team_id '{}'",
                team_id
            )));
        }
        let (team, _) = self.shop.register_team(team_id, None).await?;
        Ok(team)
    }

    async fn destroy_team_workspace(&self, team_id: &str) -> Result<()> {
        let members = self.shop.team_members(team_id).await;
        if members.is_empty() && self.shop.teams.get(team_id).await.is_none() {
            tracing::warn!(team_id, "destroy requested for unknown team");
            return Ok(());
        }
        for member in members {
            self.destroy_agent(&member).await?;
        }
        self.shop.remove_team(team_id).await
    }

    async fn stats(&self) -> BackendStats {
        self.shop.stats(0, self.settings.max_agents).await
    }

    async fn cleanup(&self) -> Result<()> {
        let mut first_error = None;
        for team in self.shop.teams.ids().await {
            if let Err(e) = self.destroy_team_workspace(&team).await {
                tracing::warn!(team_id = %team, error = %e, "team cleanup failed");
                first_error.get_or_insert(e);
            }
        }
        for agent_id in self.shop.agents.ids().await {
            if let Err(e) = self.destroy_agent(&agent_id).await {
                tracing::warn!(agent_id = %agent_id, error = %e, "agent cleanup failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn shutdown(&self) -> Result<()> {
        let mut initialized = self.shop.init_guard().await;
        let result = self.cleanup().await;
        *initialized = false;
        tracing::info!("tmux runtime shut down");
        result
    }
}
