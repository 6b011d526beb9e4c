//! In-memory backend for registry, selector and manager tests

use super::{BackendStats, Capabilities, IsolationLevel, RuntimeBackend, RuntimeKind};
use crate::agent::{
    AgentConfig, AgentSession, AgentState, AgentStatus, CommandResult, ExecOptions, Provisioned,
    ResourceSnapshot, TeamConfig, TeamWorkspace, TransferReport,
};
use crate::{AtelierError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub enum Probe {
    Available,
    Unavailable,
    Error,
    Panic,
}

pub struct FakeBackend {
    kind: RuntimeKind,
    probe: Probe,
    probe_delay: Duration,
    probes: AtomicUsize,
    fail_initialize: bool,
    initialized: AtomicBool,
    calls: Mutex<Vec<&'static str>>,
    agents: Mutex<HashMap<String, AgentSession>>,
    teams: Mutex<HashMap<String, TeamWorkspace>>,
}

impl FakeBackend {
    pub fn new(kind: RuntimeKind) -> Self {
        Self {
            kind,
            probe: Probe::Available,
            probe_delay: Duration::ZERO,
            probes: AtomicUsize::new(0),
            fail_initialize: false,
            initialized: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            agents: Mutex::new(HashMap::new()),
            teams: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_probe(mut self, probe: Probe) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Probe and lifecycle calls in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn session(&self, agent_id: &str) -> Result<AgentSession> {
        self.agents
            .lock()
            .unwrap()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| AtelierError::UnknownAgent(agent_id.to_string()))
    }
}

#[async_trait]
impl RuntimeBackend for FakeBackend {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        let container = self.kind == RuntimeKind::Container;
        Capabilities {
            isolation_level: if container {
                IsolationLevel::Container
            } else {
                IsolationLevel::Process
            },
            has_hard_resource_limits: container,
            supports_network_isolation: container,
            supports_persistence: true,
            max_concurrent_agents: 8,
        }
    }

    async fn check_availability(&self) -> Result<bool> {
        self.record("check");
        self.probes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.probe_delay).await;
        match self.probe {
            Probe::Available => Ok(true),
            Probe::Unavailable => Ok(false),
            Probe::Error => Err(AtelierError::CommandFailed("probe exploded".into())),
            Probe::Panic => panic!("probe panicked"),
        }
    }

    async fn initialize(&self) -> Result<()> {
        self.record("initialize");
        if self.fail_initialize {
            return Err(AtelierError::ProvisionFailure("cannot initialize".into()));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_agent(&self, config: AgentConfig) -> Result<Provisioned> {
        let mut agents = self.agents.lock().unwrap();
        if agents.contains_key(&config.agent_id) {
            return Err(AtelierError::AgentExists(config.agent_id));
        }
        let mut session = AgentSession::new(
            &config,
            self.kind,
            format!("fake-{}", config.agent_id),
            PathBuf::from("/fake").join(&config.agent_id),
        );
        session.state = AgentState::Running;
        agents.insert(config.agent_id.clone(), session.clone());
        Ok(Provisioned {
            session,
            warnings: Vec::new(),
            pooled: false,
        })
    }

    async fn execute_command(
        &self,
        agent_id: &str,
        command: &str,
        _options: ExecOptions,
    ) -> Result<CommandResult> {
        self.session(agent_id)?;
        Ok(CommandResult {
            stdout: format!("{}\n", command),
            stderr: String::new(),
            exit_code: 0,
            duration: Duration::from_millis(1),
            timestamp: Utc::now(),
        })
    }

    async fn transfer_files(
        &self,
        from_agent: &str,
        to_agent: &str,
        files: &[String],
    ) -> Result<TransferReport> {
        self.session(from_agent)?;
        self.session(to_agent)?;
        Ok(TransferReport {
            copied: files.to_vec(),
            failed: Vec::new(),
        })
    }

    async fn get_agent_status(&self, agent_id: &str) -> Result<AgentStatus> {
        let session = self.session(agent_id)?;
        Ok(AgentStatus {
            agent_id: session.agent_id,
            state: session.state,
            current_task: None,
            resources: ResourceSnapshot::default(),
            recent_logs: Vec::new(),
            files: Vec::new(),
            last_activity: session.last_activity,
        })
    }

    async fn list_agents(&self) -> Vec<AgentSession> {
        self.agents.lock().unwrap().values().cloned().collect()
    }

    async fn destroy_agent(&self, agent_id: &str) -> Result<()> {
        self.agents.lock().unwrap().remove(agent_id);
        Ok(())
    }

    async fn reset_agent(&self, agent_id: &str) -> Result<AgentSession> {
        self.session(agent_id)
    }

    async fn create_team_workspace(
        &self,
        team_id: &str,
        _config: TeamConfig,
    ) -> Result<TeamWorkspace> {
        let team = TeamWorkspace {
            team_id: team_id.to_string(),
            workspace_path: PathBuf::from("/fake/teams").join(team_id),
            shared_path: PathBuf::from("/fake/teams").join(team_id).join("shared"),
            agents: Default::default(),
            created_at: Utc::now(),
            volume: None,
        };
        Ok(self
            .teams
            .lock()
            .unwrap()
            .entry(team_id.to_string())
            .or_insert(team)
            .clone())
    }

    async fn destroy_team_workspace(&self, team_id: &str) -> Result<()> {
        self.teams.lock().unwrap().remove(team_id);
        Ok(())
    }

    async fn stats(&self) -> BackendStats {
        BackendStats {
            runtime: self.kind,
            initialized: self.initialized.load(Ordering::SeqCst),
            active_agents: self.agents.lock().unwrap().len(),
            agents_by_state: Default::default(),
            teams: self.teams.lock().unwrap().len(),
            pooled_instances: 0,
            commands_executed: 0,
            max_concurrent_agents: 8,
        }
    }

    async fn cleanup(&self) -> Result<()> {
        self.record("cleanup");
        self.agents.lock().unwrap().clear();
        self.teams.lock().unwrap().clear();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.record("shutdown");
        self.agents.lock().unwrap().clear();
        self.teams.lock().unwrap().clear();
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}
