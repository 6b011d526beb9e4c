//! In-memory container engine for pool and backend tests
//!
//! Exec scripts containing `sleep` block for five seconds; anything else
//! prints `ok` and exits 0, or 1 when the script contains `false`. Scripts
//! containing `noisy` exit 3 with stderr that mentions missing and stopped
//! containers.

use super::engine::{
    exec_outcome, ContainerEngine, ContainerSpec, ContainerState, ExecOutput, ExecRequest,
};
use crate::agent::ResourceSnapshot;
use crate::{AtelierError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Run(String),
    Rename(String, String),
    Update(String),
    Exec(String, String),
    Remove(String),
    CreateVolume(String),
    RemoveVolume(String),
}

#[derive(Debug, Clone)]
struct FakeContainer {
    labels: BTreeMap<String, String>,
    state: ContainerState,
}

pub struct FakeEngine {
    available: bool,
    run_delay: Duration,
    fail_runs: AtomicBool,
    fail_removes: AtomicBool,
    containers: Mutex<HashMap<String, FakeContainer>>,
    volumes: Mutex<Vec<String>>,
    calls: Mutex<Vec<EngineCall>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            available: true,
            run_delay: Duration::ZERO,
            fail_runs: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
            containers: Mutex::new(HashMap::new()),
            volumes: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    /// Pretend a container from an earlier process is still around
    pub fn with_container(self, name: &str, labels: &[(&str, &str)]) -> Self {
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                state: ContainerState {
                    running: true,
                    exit_code: 0,
                },
            },
        );
        self
    }

    pub fn fail_runs(&self, fail: bool) {
        self.fail_runs.store(fail, Ordering::SeqCst);
    }

    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Names of existing containers, sorted
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn volumes(&self) -> Vec<String> {
        self.volumes.lock().unwrap().clone()
    }

    /// Simulate the container's main process exiting
    pub fn stop(&self, name: &str, exit_code: i32) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(name) {
            container.state = ContainerState {
                running: false,
                exit_code,
            };
        }
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn no_such(name: &str) -> AtelierError {
        AtelierError::CommandFailed(format!("Error: No such container: {}", name))
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn server_version(&self) -> Result<Option<String>> {
        Ok(self.available.then(|| "27.0.0".to_string()))
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(EngineCall::Run(spec.name.clone()));
        tokio::time::sleep(self.run_delay).await;
        if self.fail_runs.load(Ordering::SeqCst) {
            return Err(AtelierError::CommandFailed("docker run failed: no space".into()));
        }
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&spec.name) {
            return Err(AtelierError::CommandFailed(format!(
                "docker run failed: name {} is already in use",
                spec.name
            )));
        }
        containers.insert(
            spec.name.clone(),
            FakeContainer {
                labels: spec.labels.clone(),
                state: ContainerState {
                    running: true,
                    exit_code: 0,
                },
            },
        );
        Ok(format!("id-{}", spec.name))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.record(EngineCall::Rename(from.to_string(), to.to_string()));
        let mut containers = self.containers.lock().unwrap();
        let container = containers.remove(from).ok_or_else(|| Self::no_such(from))?;
        containers.insert(to.to_string(), container);
        Ok(())
    }

    async fn update_limits(
        &self,
        name: &str,
        _memory: Option<&str>,
        _cpus: Option<f64>,
    ) -> Result<()> {
        self.record(EngineCall::Update(name.to_string()));
        if self.containers.lock().unwrap().contains_key(name) {
            Ok(())
        } else {
            Err(Self::no_such(name))
        }
    }

    async fn exec(&self, name: &str, request: &ExecRequest) -> Result<ExecOutput> {
        self.record(EngineCall::Exec(name.to_string(), request.script.clone()));
        let running = self
            .containers
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.state.running);
        match running {
            Some(true) => {}
            Some(false) => {
                let stderr = format!(
                    "Error response from daemon: container {} is not running\n",
                    name
                );
                return exec_outcome(name, String::new(), stderr, 1);
            }
            None => {
                let stderr = format!("Error: No such container: {}\n", name);
                return exec_outcome(name, String::new(), stderr, 1);
            }
        }

        if request.script.contains("sleep") {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if request.script.contains("noisy") {
            let stderr = "nginx is not running\nError: No such container: web\n".to_string();
            return exec_outcome(name, String::new(), stderr, 3);
        }
        let exit_code = if request.script.contains("false") { 1 } else { 0 };
        exec_outcome(name, "ok\n".to_string(), String::new(), exit_code)
    }

    async fn state(&self, name: &str) -> Result<Option<ContainerState>> {
        Ok(self.containers.lock().unwrap().get(name).map(|c| c.state))
    }

    async fn stats(&self, name: &str) -> Result<ResourceSnapshot> {
        if !self.containers.lock().unwrap().contains_key(name) {
            return Err(Self::no_such(name));
        }
        Ok(ResourceSnapshot {
            cpu_percent: Some(1.5),
            memory_bytes: Some(64 * 1024 * 1024),
            disk_bytes: None,
        })
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.record(EngineCall::Remove(name.to_string()));
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(AtelierError::Teardown(format!(
                "docker rm failed: removal of container {} is already in progress",
                name
            )));
        }
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list(&self, labels: &[String]) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| {
                labels.iter().all(|filter| {
                    let (key, value) = filter.split_once('=').unwrap_or((filter.as_str(), ""));
                    c.labels.get(key).map(String::as_str) == Some(value)
                })
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create_volume(&self, name: &str, _labels: &BTreeMap<String, String>) -> Result<()> {
        self.record(EngineCall::CreateVolume(name.to_string()));
        let mut volumes = self.volumes.lock().unwrap();
        if !volumes.iter().any(|v| v == name) {
            volumes.push(name.to_string());
        }
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.record(EngineCall::RemoveVolume(name.to_string()));
        self.volumes.lock().unwrap().retain(|v| v != name);
        Ok(())
    }
}
