//! RuntimeManager - the single entry point for agent lifecycle calls
//!
//! Owns the registry and the selector and forwards every call to the active
//! backend. There is no global instance; the binary (or the embedding
//! orchestrator) owns one manager and shares it behind an `Arc`.

use super::{
    BackendStats, Capabilities, EventBus, RuntimeBackend, RuntimeEvent, RuntimeKind,
    RuntimePreference, RuntimeRegistry, RuntimeSelector,
};
use crate::agent::{
    AgentConfig, AgentSession, AgentState, AgentStatus, CommandResult, ExecOptions, Provisioned,
    TeamConfig, TeamWorkspace, TransferReport,
};
use crate::config::RuntimeConfig;
use crate::{AtelierError, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of one health pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    /// Agents sitting in `error`
    pub unhealthy: Vec<String>,
    /// Agents destroyed for exceeding the idle timeout
    pub reaped: Vec<String>,
}

/// Aggregated counters across every registered backend
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub active: Option<RuntimeKind>,
    pub available: Vec<RuntimeKind>,
    pub backends: Vec<BackendStats>,
}

pub struct RuntimeManager {
    preference: RuntimePreference,
    idle_timeout: Option<Duration>,
    registry: RwLock<RuntimeRegistry>,
    selector: RwLock<RuntimeSelector>,
    events: EventBus,
    monitor_cancel: Mutex<CancellationToken>,
}

impl RuntimeManager {
    /// Manager over every compiled-in backend
    pub fn new(config: &RuntimeConfig) -> Self {
        let events = EventBus::new();
        let registry = RuntimeRegistry::with_defaults(config, &events);
        Self::with_registry(config, registry, events)
    }

    /// Manager over a caller-built registry; backends should share `events`
    pub fn with_registry(
        config: &RuntimeConfig,
        registry: RuntimeRegistry,
        events: EventBus,
    ) -> Self {
        Self {
            preference: config.preference,
            idle_timeout: config.idle_timeout(),
            registry: RwLock::new(registry),
            selector: RwLock::new(RuntimeSelector::new(config.fallback_chain.clone())),
            events,
            monitor_cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    /// Detect backends, select one and initialize it
    ///
    /// Idempotent: an already initialized manager returns the active kind.
    pub async fn initialize(&self) -> Result<RuntimeKind> {
        let mut registry = self.registry.write().await;
        let mut selector = self.selector.write().await;
        if let Some(kind) = selector.active_kind() {
            return Ok(kind);
        }

        if !registry.is_detected() {
            registry.detect_available_runtimes().await?;
        }
        let kind = selector
            .select(self.preference, &registry, &self.events)
            .await?;

        let mut cancel = self.monitor_cancel.lock().await;
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }

        let available = registry.kinds();
        tracing::info!(runtime = %kind, ?available, "Runtime manager initialized");
        self.events.emit(RuntimeEvent::Initialized {
            runtime: kind,
            available,
        });
        Ok(kind)
    }

    pub async fn is_initialized(&self) -> bool {
        self.selector.read().await.active().is_some()
    }

    async fn active(&self) -> Result<Arc<dyn RuntimeBackend>> {
        self.selector
            .read()
            .await
            .active()
            .ok_or(AtelierError::NotInitialized)
    }

    pub async fn active_runtime(&self) -> Option<RuntimeKind> {
        self.selector.read().await.active_kind()
    }

    pub async fn available_runtimes(&self) -> Vec<RuntimeKind> {
        self.registry.read().await.kinds()
    }

    pub async fn capabilities(&self) -> Result<Capabilities> {
        Ok(self.active().await?.capabilities())
    }

    pub async fn create_agent(&self, config: AgentConfig) -> Result<Provisioned> {
        self.active().await?.create_agent(config).await
    }

    pub async fn execute_command(
        &self,
        agent_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandResult> {
        self.active()
            .await?
            .execute_command(agent_id, command, options)
            .await
    }

    pub async fn transfer_files(
        &self,
        from_agent: &str,
        to_agent: &str,
        files: &[String],
    ) -> Result<TransferReport> {
        self.active()
            .await?
            .transfer_files(from_agent, to_agent, files)
            .await
    }

    pub async fn get_agent_status(&self, agent_id: &str) -> Result<AgentStatus> {
        self.active().await?.get_agent_status(agent_id).await
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentSession>> {
        Ok(self.active().await?.list_agents().await)
    }

    pub async fn destroy_agent(&self, agent_id: &str) -> Result<()> {
        self.active().await?.destroy_agent(agent_id).await
    }

    pub async fn reset_agent(&self, agent_id: &str) -> Result<AgentSession> {
        self.active().await?.reset_agent(agent_id).await
    }

    pub async fn create_team_workspace(
        &self,
        team_id: &str,
        config: TeamConfig,
    ) -> Result<TeamWorkspace> {
        self.active()
            .await?
            .create_team_workspace(team_id, config)
            .await
    }

    pub async fn destroy_team_workspace(&self, team_id: &str) -> Result<()> {
        self.active().await?.destroy_team_workspace(team_id).await
    }

    /// Move to another backend; the current one's agents are torn down
    pub async fn switch_runtime(&self, kind: RuntimeKind) -> Result<()> {
        let registry = self.registry.read().await;
        let mut selector = self.selector.write().await;
        if selector.active().is_none() {
            return Err(AtelierError::NotInitialized);
        }
        selector.switch(kind, &registry, &self.events).await?;
        Ok(())
    }

    pub async fn stats(&self) -> ManagerStats {
        let registry = self.registry.read().await;
        let mut backends = Vec::with_capacity(registry.backends().len());
        for backend in registry.backends() {
            backends.push(backend.stats().await);
        }
        ManagerStats {
            active: self.active_runtime().await,
            available: registry.kinds(),
            backends,
        }
    }

    /// Poll every agent once and reap the ones idle past the timeout
    pub async fn check_health(&self) -> Result<HealthReport> {
        let backend = self.active().await?;
        let mut report = HealthReport::default();

        for session in backend.list_agents().await {
            report.checked += 1;
            let status = match backend.get_agent_status(&session.agent_id).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(agent_id = %session.agent_id, error = %e, "status poll failed");
                    continue;
                }
            };

            if status.state == AgentState::Error {
                report.unhealthy.push(status.agent_id.clone());
            }

            let Some(limit) = self.idle_timeout else {
                continue;
            };
            let reapable = matches!(
                status.state,
                AgentState::Running | AgentState::Idle | AgentState::Completed
            );
            let idle = (Utc::now() - status.last_activity).to_std().unwrap_or_default();
            if reapable && idle > limit {
                tracing::info!(agent_id = %status.agent_id, ?idle, "Reaping idle agent");
                match backend.destroy_agent(&status.agent_id).await {
                    Ok(()) => report.reaped.push(status.agent_id),
                    Err(e) => {
                        tracing::warn!(agent_id = %status.agent_id, error = %e, "idle reap failed")
                    }
                }
            }
        }
        Ok(report)
    }

    /// Background task running `check_health` every `interval`
    ///
    /// Stops on `shutdown` or when the manager is dropped.
    pub async fn spawn_health_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cancel = self.monitor_cancel.lock().await.clone();
        let manager: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match manager.check_health().await {
                    Ok(report) if !report.reaped.is_empty() || !report.unhealthy.is_empty() => {
                        tracing::info!(
                            checked = report.checked,
                            reaped = ?report.reaped,
                            unhealthy = ?report.unhealthy,
                            "Health check"
                        );
                    }
                    Ok(_) | Err(AtelierError::NotInitialized) => {}
                    Err(e) => tracing::warn!(error = %e, "health check failed"),
                }
            }
            tracing::debug!("health monitor stopped");
        })
    }

    /// Release everything: clean up every backend, shut down the active one
    pub async fn shutdown(&self) -> Result<()> {
        self.monitor_cancel.lock().await.cancel();

        let registry = self.registry.read().await;
        let mut selector = self.selector.write().await;
        let mut first_error = None;

        for backend in registry.backends() {
            if let Err(e) = backend.cleanup().await {
                tracing::warn!(runtime = %backend.kind(), error = %e, "cleanup failed");
                first_error.get_or_insert(e);
            }
        }
        if let Some(active) = selector.clear() {
            if let Err(e) = active.shutdown().await {
                tracing::warn!(runtime = %active.kind(), error = %e, "shutdown failed");
                first_error.get_or_insert(e);
            }
        }

        tracing::info!("Runtime manager shut down");
        self.events.emit(RuntimeEvent::ShutdownComplete);
        first_error.map_or(Ok(()), Err)
    }
}
