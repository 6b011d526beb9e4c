//! Container backend
//!
//! One container per agent, driven through a docker-compatible CLI. The
//! runtime root is bind-mounted at [`MOUNT`] so agent files stay on the host
//! and host-side steps (handoffs, identity, status listings) work the same as
//! for tmux agents. Memory and CPU limits are enforced by the engine.

mod engine;
mod pool;

#[cfg(test)]
pub(crate) mod fake;

pub use engine::{
    ContainerEngine, ContainerSpec, ContainerState, DockerCli, ExecOutput, ExecRequest, Mount,
};
pub use pool::{ContainerPool, PoolTemplate, PooledInstance};

use crate::agent::{
    AgentConfig, AgentSession, AgentState, AgentStatus, CommandResult, ConfigurationWarning,
    ExecOptions, Provisioned, ResourceSnapshot, TeamConfig, TeamWorkspace, TransferReport,
};
use crate::config::{ContainerSettings, RuntimeConfig};
use crate::isolation::{WorkspaceLayout, Workshop, STATE_DIR};
use crate::runtime::{
    BackendStats, Capabilities, EventBus, IsolationLevel, RuntimeBackend, RuntimeEvent,
    RuntimeKind,
};
use crate::session::shell_quote;
use crate::{AtelierError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Where the runtime root appears inside every container
pub const MOUNT: &str = "/atelier";
/// Where a team's shared volume appears
pub const TEAM_MOUNT: &str = "/team";

const LABEL_MANAGED: &str = "atelier.managed";
const LABEL_ROOT: &str = "atelier.root";
const LABEL_AGENT: &str = "atelier.agent";
const LABEL_TEAM: &str = "atelier.team";
pub(crate) const LABEL_POOL: &str = "atelier.pool";
pub(crate) const LABEL_ARCHETYPE: &str = "atelier.archetype";

pub(crate) const KEEP_ALIVE: [&str; 3] = ["tail", "-f", "/dev/null"];

/// Written to `state/` with the agent's identity variables
const ENV_FILE: &str = "agent.env";

/// Labels shared by everything this root owns
fn base_labels(root: &Path) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(LABEL_ROOT.to_string(), root.to_string_lossy().into_owned());
    labels
}

fn root_mount(root: &Path) -> Mount {
    Mount {
        source: root.to_string_lossy().into_owned(),
        target: MOUNT.to_string(),
        read_only: false,
    }
}

fn container_name(agent_id: &str) -> String {
    format!("atelier-{}", agent_id)
}

fn volume_name(team_id: &str) -> String {
    format!("atelier-team-{}", team_id)
}

pub struct ContainerBackend {
    engine: Arc<dyn ContainerEngine>,
    shop: Workshop,
    settings: ContainerSettings,
    pool: ContainerPool,
}

impl ContainerBackend {
    pub fn new(config: &RuntimeConfig, events: EventBus) -> Self {
        let engine = Arc::new(DockerCli::new(config.container.binary.clone()));
        Self::with_engine(config, events, engine)
    }

    pub fn with_engine(
        config: &RuntimeConfig,
        events: EventBus,
        engine: Arc<dyn ContainerEngine>,
    ) -> Self {
        let layout = WorkspaceLayout::new(&config.root_dir);
        let pool = ContainerPool::new(
            engine.clone(),
            events.clone(),
            PoolTemplate {
                labels: base_labels(layout.root()),
                mounts: vec![root_mount(layout.root())],
                network_disabled: config.container.network_isolation,
            },
        );
        Self {
            engine,
            shop: Workshop::new(
                RuntimeKind::Container,
                layout,
                events,
                config.log_tail_lines,
            ),
            settings: config.container.clone(),
            pool,
        }
    }

    fn events(&self) -> &EventBus {
        &self.shop.events
    }

    /// Path of a host workspace directory as seen from inside a container
    fn container_path(&self, host: &Path) -> String {
        match self.shop.layout.relative(host) {
            Some(rel) if !rel.as_os_str().is_empty() => {
                format!("{}/{}", MOUNT, rel.to_string_lossy())
            }
            _ => MOUNT.to_string(),
        }
    }

    fn requested_image(&self, config: &AgentConfig) -> String {
        config
            .base_image
            .clone()
            .unwrap_or_else(|| self.settings.default_image.clone())
    }

    fn owner_filters(&self) -> Vec<String> {
        base_labels(self.shop.layout.root())
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    /// Remove containers under this root that neither an agent nor the pool owns
    pub async fn sweep_stale(&self) -> Result<usize> {
        let live: Vec<String> = self
            .shop
            .agents
            .list()
            .await
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        let pooled = self.pool.instance_names().await;

        let mut removed = 0;
        for name in self.engine.list(&self.owner_filters()).await? {
            if live.contains(&name) || pooled.contains(&name) {
                continue;
            }
            match self.engine.remove(&name).await {
                Ok(()) => {
                    tracing::info!(container = %name, "Removed stale container");
                    removed += 1;
                }
                Err(e) => tracing::warn!(container = %name, error = %e, "stale container removal failed"),
            }
        }
        Ok(removed)
    }

    async fn warm_pool(&self) {
        let mut starts = tokio::task::JoinSet::new();
        for archetype in &self.settings.pool.archetypes {
            let pool = self.pool.clone();
            let name = archetype.name.clone();
            let image = archetype
                .image
                .clone()
                .unwrap_or_else(|| self.settings.default_image.clone());
            starts.spawn(async move {
                let result = pool.warm(&name, &image).await;
                (name, result)
            });
        }
        while let Some(joined) = starts.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((archetype, Err(e))) => {
                    tracing::warn!(archetype = %archetype, error = %e, "pool warm-up failed")
                }
                Err(e) => tracing::warn!(error = %e, "pool warm-up task failed"),
            }
        }
    }

    fn agent_spec(
        &self,
        config: &AgentConfig,
        name: &str,
        image: &str,
        volume: Option<&str>,
    ) -> ContainerSpec {
        let mut labels = base_labels(self.shop.layout.root());
        labels.insert(LABEL_AGENT.to_string(), config.agent_id.clone());
        labels.insert(LABEL_TEAM.to_string(), config.team_id.clone());
        labels.insert(LABEL_ARCHETYPE.to_string(), config.agent_type.clone());

        let mut mounts = vec![root_mount(self.shop.layout.root())];
        if let Some(volume) = volume {
            mounts.push(Mount {
                source: volume.to_string(),
                target: TEAM_MOUNT.to_string(),
                read_only: false,
            });
        }

        let workspace = self
            .shop
            .layout
            .agent_dir(&config.team_id, &config.agent_id);
        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            labels,
            env: config.identity_env(),
            mounts,
            memory: config.memory_limit.clone(),
            cpus: config.cpu_limit,
            network_disabled: self.settings.network_isolation,
            workdir: Some(self.container_path(&workspace)),
            command: KEEP_ALIVE.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Claim a warm instance or start a fresh one; returns whether it was pooled
    async fn acquire(
        &self,
        config: &AgentConfig,
        name: &str,
        team: &TeamWorkspace,
        warnings: &mut Vec<ConfigurationWarning>,
    ) -> Result<bool> {
        let image = self.requested_image(config);

        if self.settings.pool.enabled {
            if let Some(instance) = self.pool.claim(&config.agent_type, &image).await {
                self.adopt(&instance, config, name).await?;
                if team.volume.is_some() {
                    warnings.push(ConfigurationWarning::new(
                        "team_volume",
                        "pooled instance started without the team volume",
                    ));
                }
                return Ok(true);
            }
        }

        let spec = self.agent_spec(config, name, &image, team.volume.as_deref());
        self.engine.run(&spec).await.map_err(|e| {
            AtelierError::ProvisionFailure(format!("container {}: {}", name, e))
        })?;
        Ok(false)
    }

    /// Give a pooled instance the agent's name and limits
    async fn adopt(&self, instance: &PooledInstance, config: &AgentConfig, name: &str) -> Result<()> {
        if let Err(e) = self.engine.rename(&instance.name, name).await {
            if let Err(cleanup) = self.engine.remove(&instance.name).await {
                tracing::warn!(container = %instance.name, error = %cleanup, "pool instance cleanup failed");
            }
            return Err(AtelierError::ProvisionFailure(format!(
                "claiming {}: {}",
                instance.name, e
            )));
        }
        self.engine
            .update_limits(name, config.memory_limit.as_deref(), config.cpu_limit)
            .await
            .map_err(|e| AtelierError::ProvisionFailure(format!("limits for {}: {}", name, e)))
    }

    /// Write the identity variables to `state/agent.env` inside the container
    async fn inject_env(
        &self,
        config: &AgentConfig,
        name: &str,
        workspace: &Path,
        warnings: &mut Vec<ConfigurationWarning>,
    ) {
        let state = format!("{}/{}", self.container_path(workspace), STATE_DIR);
        let body: String = config
            .identity_env()
            .iter()
            .map(|(k, v)| format!("export {}={}\n", k, shell_quote(v)))
            .collect();
        let request = ExecRequest {
            script: format!(
                "mkdir -p {dir} && printf '%s' {body} > {dir}/{file}",
                dir = shell_quote(&state),
                body = shell_quote(&body),
                file = ENV_FILE
            ),
            ..Default::default()
        };

        match self.engine.exec(name, &request).await {
            Ok(out) if out.exit_code == 0 => {}
            Ok(out) => warnings.push(ConfigurationWarning::new(
                "environment",
                format!("exit {}: {}", out.exit_code, out.stderr.trim()),
            )),
            Err(e) => warnings.push(ConfigurationWarning::new("environment", e)),
        }
    }

    /// Team an agent joins implicitly
    ///
    /// Implicit teams get no volume; their `shared/` directory is already
    /// visible through the root mount, so pooled claims lose nothing.
    async fn ensure_team(&self, team_id: &str) -> Result<TeamWorkspace> {
        match self.shop.teams.get(team_id).await {
            Some(team) => Ok(team),
            None => {
                self.create_team_workspace(team_id, TeamConfig { shared_volume: false })
                    .await
            }
        }
    }
}

#[async_trait]
impl RuntimeBackend for ContainerBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Container
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            isolation_level: IsolationLevel::Container,
            has_hard_resource_limits: true,
            supports_network_isolation: true,
            supports_persistence: true,
            max_concurrent_agents: self.settings.max_agents,
        }
    }

    async fn check_availability(&self) -> Result<bool> {
        Ok(self.engine.server_version().await?.is_some())
    }

    async fn initialize(&self) -> Result<()> {
        let mut initialized = self.shop.init_guard().await;
        if *initialized {
            return Ok(());
        }
        let version = self.engine.server_version().await?.ok_or_else(|| {
            AtelierError::BackendUnavailable(format!("{} is not usable", self.settings.binary))
        })?;
        self.shop.layout.prepare_root().await?;
        self.pool.reopen().await;

        match self.sweep_stale().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(containers = n, "Removed containers from a previous run"),
            Err(e) => tracing::warn!(error = %e, "stale container sweep failed"),
        }
        if self.settings.pool.enabled {
            self.warm_pool().await;
        }

        *initialized = true;
        let pooled = self.pool.len().await;
        tracing::info!(
            %version,
            root = ?self.shop.layout.root(),
            pooled,
            "container runtime initialized"
        );
        Ok(())
    }

    async fn create_agent(&self, config: AgentConfig) -> Result<Provisioned> {
        self.shop.ensure_initialized().await?;
        config.validate()?;
        let team = self.ensure_team(&config.team_id).await?;

        let name = container_name(&config.agent_id);
        let workspace = self
            .shop
            .layout
            .agent_dir(&config.team_id, &config.agent_id);
        let session = AgentSession::new(
            &config,
            RuntimeKind::Container,
            name.clone(),
            workspace.clone(),
        );
        self.shop
            .agents
            .reserve(&config, session, self.settings.max_agents)
            .await?;

        let mut warnings = Vec::new();
        let acquired = match self.shop.prepare_workspace(&config).await {
            Ok(_) => self.acquire(&config, &name, &team, &mut warnings).await,
            Err(e) => Err(e),
        };
        let pooled = match acquired {
            Ok(pooled) => pooled,
            Err(e) => {
                tracing::error!(agent_id = %config.agent_id, error = %e, "provisioning failed");
                self.shop.agents.release(&config.agent_id).await;
                if let Err(cleanup) = self.engine.remove(&name).await {
                    tracing::warn!(container = %name, error = %cleanup, "cleanup after failed provision");
                }
                return Err(e);
            }
        };

        self.inject_env(&config, &name, &workspace, &mut warnings)
            .await;
        self.shop
            .configure_workspace(&config, &workspace, &mut warnings)
            .await;
        let session = self.shop.finish_create(&config, pooled, &warnings).await?;

        Ok(Provisioned {
            session,
            warnings,
            pooled,
        })
    }

    async fn execute_command(
        &self,
        agent_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandResult> {
        let config = self.shop.agents.config(agent_id).await?;
        let ticket = self.shop.agents.begin_command(agent_id, command).await?;

        let base = self.container_path(&ticket.workspace_path);
        let workdir = match options.workdir.as_deref() {
            Some(dir) => format!("{}/{}", base, dir.trim_start_matches('/')),
            None => base,
        };
        let mut env = config.identity_env();
        env.extend(options.env);
        let request = ExecRequest {
            script: command.to_string(),
            workdir: Some(workdir),
            env,
        };

        let exec = async {
            let started = Instant::now();
            let out = self.engine.exec(&ticket.session_id, &request).await?;
            Ok::<_, AtelierError>(CommandResult {
                stdout: out.stdout,
                stderr: out.stderr,
                exit_code: out.exit_code,
                duration: started.elapsed(),
                timestamp: Utc::now(),
            })
        };
        let outcome = ticket.run(options.timeout, exec).await;

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
        let mut resources = ResourceSnapshot::default();

        let polls_container =
            !session.state.is_terminal() && session.state != AgentState::Initializing;
        if polls_container {
            let next = match self.engine.state(&session.session_id).await {
                Ok(Some(state)) if state.running => {
                    match self.engine.stats(&session.session_id).await {
                        Ok(snapshot) => resources = snapshot,
                        Err(e) => tracing::debug!(agent_id, error = %e, "stats unavailable"),
                    }
                    None
                }
                Ok(Some(state)) if state.exit_code == 0 => Some(AgentState::Completed),
                Ok(Some(state)) => {
                    tracing::warn!(agent_id, exit_code = state.exit_code, "container exited");
                    Some(AgentState::Error)
                }
                Ok(None) => {
                    tracing::warn!(agent_id, container = %session.session_id, "container vanished");
                    Some(AgentState::Error)
                }
                Err(e) => {
                    tracing::warn!(agent_id, error = %e, "container inspect failed");
                    None
                }
            };
            if let Some(next) = next {
                if let Err(e) = self.shop.agents.set_state(agent_id, next).await {
                    tracing::debug!(agent_id, error = %e, "state update skipped");
                }
            }
        }

        self.shop.status(agent_id, resources).await
    }

    async fn list_agents(&self) -> Vec<AgentSession> {
        self.shop.agents.list().await
    }

    async fn destroy_agent(&self, agent_id: &str) -> Result<()> {
        let Some(session) = self.shop.agents.cancel_commands(agent_id).await else {
            tracing::warn!(agent_id, "destroy requested for unknown agent");
            return Ok(());
        };
        // The agent stays registered until its container is gone
        if let Err(e) = self.engine.remove(&session.session_id).await {
            tracing::warn!(agent_id, container = %session.session_id, error = %e, "container removal failed");
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

        tracing::info!(agent_id, container = %session.session_id, "Agent destroyed");
        self.events().emit(RuntimeEvent::AgentDestroyed {
            agent_id: agent_id.to_string(),
            team_id: session.team_id,
        });
        Ok(())
    }

    async fn reset_agent(&self, agent_id: &str) -> Result<AgentSession> {
        let config = self.shop.agents.config(agent_id).await?;
        let session = self.shop.agents.begin_reset(agent_id).await?;
        self.engine.remove(&session.session_id).await?;

        let volume = self
            .shop
            .teams
            .get(&config.team_id)
            .await
            .and_then(|t| t.volume);
        let image = self.requested_image(&config);
        let spec = self.agent_spec(&config, &session.session_id, &image, volume.as_deref());
        if let Err(e) = self.engine.run(&spec).await {
            self.shop.agents.set_state(agent_id, AgentState::Error).await?;
            return Err(AtelierError::ProvisionFailure(format!(
                "container {}: {}",
                session.session_id, e
            )));
        }

        let mut warnings = Vec::new();
        self.inject_env(&config, &session.session_id, &session.workspace_path, &mut warnings)
            .await;
        for warning in &warnings {
            tracing::warn!(agent_id, %warning, "agent reset with degraded setup");
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
        config: TeamConfig,
    ) -> Result<TeamWorkspace> {
        self.shop.ensure_initialized().await?;
        if !crate::agent::is_valid_name(team_id) {
            return Err(AtelierError::ProvisionFailure(format!(
                "invalid team_id '{}'",
                team_id
            )));
        }
        if let Some(existing) = self.shop.teams.get(team_id).await {
            return Ok(existing);
        }

        let volume = if config.shared_volume {
            let name = volume_name(team_id);
            let mut labels = base_labels(self.shop.layout.root());
            labels.insert(LABEL_TEAM.to_string(), team_id.to_string());
            self.engine
                .create_volume(&name, &labels)
                .await
                .map_err(|e| AtelierError::ProvisionFailure(format!("volume {}: {}", name, e)))?;
            Some(name)
        } else {
            None
        };

        let (team, created) = self.shop.register_team(team_id, volume.clone()).await?;
        if !created && team.volume != volume {
            // Lost a race with another create; drop our volume
            if let Some(volume) = volume {
                if let Err(e) = self.engine.remove_volume(&volume).await {
                    tracing::warn!(volume = %volume, error = %e, "duplicate volume removal failed");
                }
            }
        }
        Ok(team)
    }

    async fn destroy_team_workspace(&self, team_id: &str) -> Result<()> {
        let members = self.shop.team_members(team_id).await;
        let Some(team) = self.shop.teams.get(team_id).await else {
            if members.is_empty() {
                tracing::warn!(team_id, "destroy requested for unknown team");
                return Ok(());
            }
            for member in members {
                self.destroy_agent(&member).await?;
            }
            return Ok(());
        };

        for member in members {
            self.destroy_agent(&member).await?;
        }
        if let Some(volume) = team.volume.as_deref() {
            self.engine.remove_volume(volume).await?;
        }
        self.shop.remove_team(team_id).await
    }

    async fn stats(&self) -> BackendStats {
        self.shop
            .stats(self.pool.len().await, self.settings.max_agents)
            .await
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
        let cleaned = self.cleanup().await;
        let pool = self.pool.shutdown().await;
        let result = cleaned.and(pool);
        *initialized = false;
        tracing::info!("container runtime shut down");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{EngineCall, FakeEngine};
    use super::*;
    use crate::config::PoolArchetype;
    use std::time::Duration;

    async fn backend(
        root: &Path,
        engine: FakeEngine,
        archetypes: &[&str],
    ) -> (Arc<ContainerBackend>, Arc<FakeEngine>) {
        let mut config = RuntimeConfig::default();
        config.root_dir = root.to_path_buf();
        config.container.pool.archetypes = archetypes
            .iter()
            .map(|name| PoolArchetype {
                name: name.to_string(),
                image: None,
            })
            .collect();
        let engine = Arc::new(engine);
        let backend = ContainerBackend::with_engine(&config, EventBus::new(), engine.clone());
        backend.initialize().await.unwrap();
        (Arc::new(backend), engine)
    }

    fn position(calls: &[EngineCall], wanted: &EngineCall) -> usize {
        calls
            .iter()
            .position(|c| c == wanted)
            .unwrap_or_else(|| panic!("{:?} not called", wanted))
    }

    #[tokio::test]
    async fn unavailable_engine_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.root_dir = root.path().to_path_buf();
        let backend = ContainerBackend::with_engine(
            &config,
            EventBus::new(),
            Arc::new(FakeEngine::unavailable()),
        );
        assert!(!backend.check_availability().await.unwrap());
        assert!(matches!(
            backend.initialize().await,
            Err(AtelierError::BackendUnavailable(_))
        ));
        assert!(matches!(
            backend.create_agent(AgentConfig::new("a1", "coder")).await,
            Err(AtelierError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn initialize_runs_on_a_spawned_task() {
        let root = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.root_dir = root.path().to_path_buf();
        config.container.pool.archetypes = vec![PoolArchetype {
            name: "coder".to_string(),
            image: None,
        }];
        let backend = Arc::new(ContainerBackend::with_engine(
            &config,
            EventBus::new(),
            Arc::new(FakeEngine::new()),
        ));

        let task = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.initialize().await })
        };
        task.await.unwrap().unwrap();
        let stats = backend.stats().await;
        assert!(stats.initialized);
        assert_eq!(stats.pooled_instances, 1);
    }

    #[tokio::test]
    async fn fresh_agent_gets_container_and_identity() {
        let root = tempfile::tempdir().unwrap();
        let (backend, engine) = backend(root.path(), FakeEngine::new(), &[]).await;

        let provisioned = backend
            .create_agent(AgentConfig::new("a1", "coder").with_limits(Some("512m"), Some(1.0)))
            .await
            .unwrap();
        assert!(!provisioned.pooled);
        assert!(provisioned.warnings.is_empty());
        assert_eq!(provisioned.session.session_id, "atelier-a1");
        assert_eq!(provisioned.session.state, AgentState::Running);
        assert!(provisioned
            .session
            .workspace_path
            .join("state/identity.json")
            .is_file());

        let calls = engine.calls();
        // implicit team: shared/ comes through the root mount
        assert!(!calls.iter().any(|c| matches!(c, EngineCall::CreateVolume(_))));
        assert!(calls.contains(&EngineCall::Run("atelier-a1".into())));
        assert!(calls.iter().any(|c| matches!(
            c,
            EngineCall::Exec(name, script) if name == "atelier-a1" && script.contains("agent.env")
        )));
        assert_eq!(
            backend.container_path(&provisioned.session.workspace_path),
            "/atelier/teams/default/agents/a1"
        );
    }

    #[tokio::test]
    async fn warm_pool_skips_fresh_provisioning_and_refills() {
        let root = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new().with_run_delay(Duration::from_millis(200));
        let (backend, engine) = backend(root.path(), engine, &["coder"]).await;
        assert!(backend.pool.contains("coder").await);
        let mut events = backend.events().subscribe();

        let provisioned = backend
            .create_agent(AgentConfig::new("a1", "coder"))
            .await
            .unwrap();
        assert!(provisioned.pooled);
        assert!(!backend.pool.contains("coder").await);
        assert!(provisioned.warnings.is_empty());

        let calls = engine.calls();
        assert!(!calls.contains(&EngineCall::Run("atelier-a1".into())));
        assert!(calls.iter().any(|c| matches!(
            c,
            EngineCall::Rename(from, to) if from.starts_with("atelier-pool-coder-") && to == "atelier-a1"
        )));
        assert!(calls.contains(&EngineCall::Update("atelier-a1".into())));

        backend.pool.wait_idle().await;
        assert!(backend.pool.contains("coder").await);
        let mut replenished = false;
        while let Ok(event) = events.try_recv() {
            replenished |= event == RuntimeEvent::PoolReplenished { archetype: "coder".into() };
        }
        assert!(replenished);
    }

    #[tokio::test]
    async fn pooled_claim_into_volume_team_warns() {
        let root = tempfile::tempdir().unwrap();
        let (backend, _engine) = backend(root.path(), FakeEngine::new(), &["coder"]).await;
        backend
            .create_team_workspace("blue", TeamConfig::default())
            .await
            .unwrap();

        let provisioned = backend
            .create_agent(AgentConfig::new("a1", "coder").with_team("blue"))
            .await
            .unwrap();
        assert!(provisioned.pooled);
        assert_eq!(provisioned.warnings.len(), 1);
        assert_eq!(provisioned.warnings[0].step, "team_volume");
    }

    #[tokio::test]
    async fn other_image_bypasses_pool() {
        let root = tempfile::tempdir().unwrap();
        let (backend, engine) = backend(root.path(), FakeEngine::new(), &["coder"]).await;

        let provisioned = backend
            .create_agent(AgentConfig::new("a1", "coder").with_image("rust:1.80"))
            .await
            .unwrap();
        assert!(!provisioned.pooled);
        assert!(engine.calls().contains(&EngineCall::Run("atelier-a1".into())));
        assert!(backend.pool.contains("coder").await);
    }

    #[tokio::test]
    async fn failed_provision_releases_agent_id() {
        let root = tempfile::tempdir().unwrap();
        let (backend, engine) = backend(root.path(), FakeEngine::new(), &[]).await;
        backend
            .create_team_workspace("default", TeamConfig::default())
            .await
            .unwrap();

        engine.fail_runs(true);
        let err = backend
            .create_agent(AgentConfig::new("a1", "coder"))
            .await
            .unwrap_err();
        assert!(matches!(err, AtelierError::ProvisionFailure(_)));
        assert!(backend.list_agents().await.is_empty());

        engine.fail_runs(false);
        assert!(backend
            .create_agent(AgentConfig::new("a1", "coder"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn execute_runs_in_workspace_and_times_out() {
        let root = tempfile::tempdir().unwrap();
        let (backend, _engine) = backend(root.path(), FakeEngine::new(), &[]).await;
        backend
            .create_agent(AgentConfig::new("a1", "coder"))
            .await
            .unwrap();

        let result = backend
            .execute_command("a1", "cargo test", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.stdout, "ok\n");
        assert!(result.success());

        let started = Instant::now();
        let err = backend
            .execute_command(
                "a1",
                "sleep 60",
                ExecOptions::with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AtelierError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));

        let again = backend
            .execute_command("a1", "echo ok", ExecOptions::default())
            .await
            .unwrap();
        assert!(again.success());
        assert_eq!(backend.stats().await.commands_executed, 3);
    }

    #[tokio::test]
    async fn command_stderr_about_containers_is_plain_output() {
        let root = tempfile::tempdir().unwrap();
        let (backend, _engine) = backend(root.path(), FakeEngine::new(), &[]).await;
        backend
            .create_agent(AgentConfig::new("a1", "coder"))
            .await
            .unwrap();

        let result = backend
            .execute_command("a1", "noisy healthcheck", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(result.stderr.contains("nginx is not running"));
        assert_eq!(
            backend.get_agent_status("a1").await.unwrap().state,
            AgentState::Idle
        );
        assert!(backend
            .execute_command("a1", "echo hi", ExecOptions::default())
            .await
            .unwrap()
            .success());
    }

    #[tokio::test]
    async fn exec_in_stopped_container_is_an_engine_failure() {
        let root = tempfile::tempdir().unwrap();
        let (backend, engine) = backend(root.path(), FakeEngine::new(), &[]).await;
        backend
            .create_agent(AgentConfig::new("a1", "coder"))
            .await
            .unwrap();
        engine.stop("atelier-a1", 0);

        let err = backend
            .execute_command("a1", "ls", ExecOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AtelierError::CommandFailed(_)));
    }

    #[tokio::test]
    async fn status_follows_container_state() {
        let root = tempfile::tempdir().unwrap();
        let (backend, engine) = backend(root.path(), FakeEngine::new(), &[]).await;
        for id in ["a1", "a2"] {
            backend
                .create_agent(AgentConfig::new(id, "coder"))
                .await
                .unwrap();
        }

        let status = backend.get_agent_status("a1").await.unwrap();
        assert_eq!(status.state, AgentState::Running);
        assert_eq!(status.resources.cpu_percent, Some(1.5));
        assert!(status.resources.disk_bytes.is_some());

        engine.stop("atelier-a1", 0);
        engine.stop("atelier-a2", 137);
        assert_eq!(
            backend.get_agent_status("a1").await.unwrap().state,
            AgentState::Completed
        );
        assert_eq!(
            backend.get_agent_status("a2").await.unwrap().state,
            AgentState::Error
        );
    }

    #[tokio::test]
    async fn reset_replaces_failed_container() {
        let root = tempfile::tempdir().unwrap();
        let (backend, engine) = backend(root.path(), FakeEngine::new(), &[]).await;
        backend
            .create_agent(AgentConfig::new("a1", "coder"))
            .await
            .unwrap();
        engine.stop("atelier-a1", 1);
        backend.get_agent_status("a1").await.unwrap();

        let session = backend.reset_agent("a1").await.unwrap();
        assert_eq!(session.state, AgentState::Running);
        let runs = engine
            .calls()
            .iter()
            .filter(|c| **c == EngineCall::Run("atelier-a1".into()))
            .count();
        assert_eq!(runs, 2);
        assert!(backend
            .execute_command("a1", "ls", ExecOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn team_volume_removed_after_members() {
        let root = tempfile::tempdir().unwrap();
        let (backend, engine) = backend(root.path(), FakeEngine::new(), &[]).await;
        let team = backend
            .create_team_workspace("blue", TeamConfig::default())
            .await
            .unwrap();
        assert_eq!(team.volume.as_deref(), Some("atelier-team-blue"));
        for id in ["a1", "a2"] {
            backend
                .create_agent(AgentConfig::new(id, "coder").with_team("blue"))
                .await
                .unwrap();
        }

        backend.destroy_team_workspace("blue").await.unwrap();
        let calls = engine.calls();
        let volume = position(&calls, &EngineCall::RemoveVolume("atelier-team-blue".into()));
        assert!(position(&calls, &EngineCall::Remove("atelier-a1".into())) < volume);
        assert!(position(&calls, &EngineCall::Remove("atelier-a2".into())) < volume);
        assert!(engine.volumes().is_empty());
        assert!(backend.list_agents().await.is_empty());

        backend.destroy_team_workspace("blue").await.unwrap();
        backend.destroy_agent("a1").await.unwrap();
    }

    #[tokio::test]
    async fn failed_removal_keeps_agent_for_retry() {
        let root = tempfile::tempdir().unwrap();
        let (backend, engine) = backend(root.path(), FakeEngine::new(), &[]).await;
        backend
            .create_agent(AgentConfig::new("a2", "coder"))
            .await
            .unwrap();
        let mut events = backend.events().subscribe();

        engine.fail_removes(true);
        let err = backend.destroy_agent("a2").await.unwrap_err();
        assert!(matches!(err, AtelierError::Teardown(_)));
        assert_eq!(backend.list_agents().await.len(), 1);
        assert!(events.try_recv().is_err());
        // still usable while it waits for teardown
        assert!(backend
            .execute_command("a2", "ls", ExecOptions::default())
            .await
            .is_ok());
        while events.try_recv().is_ok() {}

        engine.fail_removes(false);
        backend.destroy_agent("a2").await.unwrap();
        assert!(backend.list_agents().await.is_empty());
        assert!(!engine.running().contains(&"atelier-a2".to_string()));
        assert!(matches!(
            events.try_recv().unwrap(),
            RuntimeEvent::AgentDestroyed { .. }
        ));
    }

    #[tokio::test]
    async fn cleanup_keeps_pool_replenishing() {
        let root = tempfile::tempdir().unwrap();
        let (backend, _engine) = backend(root.path(), FakeEngine::new(), &["coder"]).await;
        backend.cleanup().await.unwrap();
        assert!(backend.pool.contains("coder").await);

        let provisioned = backend
            .create_agent(AgentConfig::new("a1", "coder"))
            .await
            .unwrap();
        assert!(provisioned.pooled);
        backend.pool.wait_idle().await;
        assert!(backend.pool.contains("coder").await);
    }

    #[tokio::test]
    async fn initialize_removes_only_this_roots_stale_containers() {
        let root = tempfile::tempdir().unwrap();
        let root_label = root.path().to_string_lossy().into_owned();
        let engine = FakeEngine::new()
            .with_container(
                "atelier-old",
                &[(LABEL_MANAGED, "true"), (LABEL_ROOT, root_label.as_str())],
            )
            .with_container(
                "atelier-elsewhere",
                &[(LABEL_MANAGED, "true"), (LABEL_ROOT, "/srv/other")],
            );
        let (_backend, engine) = backend(root.path(), engine, &[]).await;
        assert_eq!(engine.running(), vec!["atelier-elsewhere"]);
    }

    #[tokio::test]
    async fn shutdown_removes_agents_and_pool() {
        let root = tempfile::tempdir().unwrap();
        let (backend, engine) = backend(root.path(), FakeEngine::new(), &["coder"]).await;
        backend
            .create_agent(AgentConfig::new("a1", "reviewer"))
            .await
            .unwrap();
        assert_eq!(backend.stats().await.pooled_instances, 1);

        backend.shutdown().await.unwrap();
        assert!(engine.running().is_empty());
        assert!(engine.volumes().is_empty());
        let stats = backend.stats().await;
        assert!(!stats.initialized);
        assert_eq!(stats.pooled_instances, 0);

        backend.initialize().await.unwrap();
        assert!(backend.pool.contains("coder").await);
    }
}
