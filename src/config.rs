//! Atelier runtime configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is a
//! valid configuration. Environment overrides are applied last.

use crate::runtime::{RuntimeKind, RuntimePreference};
use crate::{AtelierError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the configured runtime preference (`auto`, `container`, `tmux`)
pub const ENV_RUNTIME: &str = "ATELIER_RUNTIME";
/// Overrides the workspace root directory
pub const ENV_ROOT: &str = "ATELIER_ROOT";

/// Top-level runtime config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub preference: RuntimePreference,
    /// Walked in order when the preference is `auto`
    pub fallback_chain: Vec<RuntimeKind>,
    /// Host directory holding every team and agent workspace
    pub root_dir: PathBuf,
    /// Output lines returned by status polls
    pub log_tail_lines: usize,
    /// Agents idle for longer than this are reaped by the health monitor
    pub idle_timeout_secs: Option<u64>,
    pub container: ContainerSettings,
    pub tmux: TmuxSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            preference: RuntimePreference::Auto,
            fallback_chain: RuntimeKind::default_chain(),
            root_dir: default_root_dir(),
            log_tail_lines: 20,
            idle_timeout_secs: None,
            container: ContainerSettings::default(),
            tmux: TmuxSettings::default(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".atelier")
        .join("workspaces")
}

impl RuntimeConfig {
    /// Read a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AtelierError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: RuntimeConfig = serde_json::from_str(&raw)?;
        tracing::debug!("Loaded runtime config from {:?}", path);
        Ok(config)
    }

    /// Config file if given, defaults otherwise, then env overrides
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.with_overrides(
            std::env::var(ENV_RUNTIME).ok().as_deref(),
            std::env::var(ENV_ROOT).ok().as_deref(),
        )
    }

    /// Apply `ATELIER_RUNTIME` / `ATELIER_ROOT` style overrides and validate
    pub fn with_overrides(mut self, runtime: Option<&str>, root: Option<&str>) -> Result<Self> {
        if let Some(runtime) = runtime.filter(|r| !r.trim().is_empty()) {
            self.preference = runtime.parse()?;
        }
        if let Some(root) = root.filter(|r| !r.trim().is_empty()) {
            self.root_dir = PathBuf::from(root);
        }
        self.validate()?;
        self.absolutize()
    }

    pub fn validate(&self) -> Result<()> {
        if self.fallback_chain.is_empty() {
            return Err(AtelierError::Config("fallback_chain is empty".into()));
        }
        if self.tmux.poll_interval_ms == 0 {
            return Err(AtelierError::Config("tmux.poll_interval_ms must be > 0".into()));
        }
        if self.container.max_agents == 0 || self.tmux.max_agents == 0 {
            return Err(AtelierError::Config("max_agents must be > 0".into()));
        }
        if self.tmux.session_prefix.is_empty() {
            return Err(AtelierError::Config("tmux.session_prefix is empty".into()));
        }
        for archetype in &self.container.pool.archetypes {
            if !crate::agent::is_valid_name(&archetype.name) {
                return Err(AtelierError::Config(format!(
                    "invalid pool archetype '{}'",
                    archetype.name
                )));
            }
        }
        Ok(())
    }

    /// Container mounts need an absolute host path
    fn absolutize(mut self) -> Result<Self> {
        if self.root_dir.is_relative() {
            self.root_dir = std::env::current_dir()?.join(&self.root_dir);
        }
        Ok(self)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Container backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Engine CLI (`docker`, or a compatible one such as `podman`)
    pub binary: String,
    /// Image used when the agent request names none
    pub default_image: String,
    /// Run agents without network access
    pub network_isolation: bool,
    pub max_agents: usize,
    pub pool: PoolSettings,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            default_image: "ubuntu:24.04".to_string(),
            network_isolation: false,
            max_agents: 20,
            pool: PoolSettings::default(),
        }
    }
}

/// Warm container pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub enabled: bool,
    /// Archetypes kept warm, one instance each
    pub archetypes: Vec<PoolArchetype>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            archetypes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolArchetype {
    pub name: String,
    /// Defaults to `container.default_image`
    #[serde(default)]
    pub image: Option<String>,
}

/// Multiplexed-session backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TmuxSettings {
    pub binary: String,
    /// Every session this process owns starts with this prefix
    pub session_prefix: String,
    pub max_agents: usize,
    /// How often the pane is captured while a command runs
    pub poll_interval_ms: u64,
    /// Scrollback lines searched for command sentinels
    pub history_lines: usize,
}

impl Default for TmuxSettings {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
            session_prefix: "atelier-".to_string(),
            max_agents: 10,
            poll_interval_ms: 100,
            history_lines: 2000,
        }
    }
}

impl TmuxSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
