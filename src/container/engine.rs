//! Container engine seam and its docker-compatible CLI implementation

use crate::agent::ResourceSnapshot;
use crate::{AtelierError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    fn to_arg(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// Everything needed to start one detached container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    /// Docker-style size (`512m`)
    pub memory: Option<String>,
    pub cpus: Option<f64>,
    pub network_disabled: bool,
    pub workdir: Option<String>,
    /// Keeps the container alive between execs
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub script: String,
    pub workdir: Option<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: i32,
}

/// Container operations the container backend needs
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    /// Server version, `None` when the CLI or daemon is unreachable
    async fn server_version(&self) -> Result<Option<String>>;

    /// Start a detached container, returning its id
    async fn run(&self, spec: &ContainerSpec) -> Result<String>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn update_limits(&self, name: &str, memory: Option<&str>, cpus: Option<f64>)
        -> Result<()>;

    /// Run a shell script inside a running container
    async fn exec(&self, name: &str, request: &ExecRequest) -> Result<ExecOutput>;

    /// `None` when the container does not exist
    async fn state(&self, name: &str) -> Result<Option<ContainerState>>;

    async fn stats(&self, name: &str) -> Result<ResourceSnapshot>;

    /// Force-remove; missing containers are not an error
    async fn remove(&self, name: &str) -> Result<()>;

    /// Names of containers carrying every `key=value` label
    async fn list(&self, labels: &[String]) -> Result<Vec<String>>;

    async fn create_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Missing volumes are not an error
    async fn remove_volume(&self, name: &str) -> Result<()>;
}

/// `docker` (or a CLI-compatible engine such as `podman`)
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run a CLI command and return trimmed stdout on success
    async fn run_docker(&self, args: &[&str]) -> std::result::Result<String, String> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| format!("failed to exec {}: {}", self.binary, e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().unwrap_or(&""),
                stderr.trim()
            ))
        }
    }

    async fn run_cmd(&self, args: &[&str]) -> Result<String> {
        self.run_docker(args).await.map_err(AtelierError::CommandFailed)
    }
}

fn is_missing(err: &str) -> bool {
    err.contains("No such container")
        || err.contains("No such object")
        || err.contains("no such volume")
        || err.contains("No such volume")
}

/// Errors the engine reports about itself rather than the command it ran
///
/// `docker exec` exits 125 when it never started the command. Anything else
/// counts only when the engine's own message opens the error stream; the
/// command's stderr may mention containers too.
fn is_engine_error(exit_code: i32, stderr: &str) -> bool {
    if exit_code == 0 {
        return false;
    }
    if exit_code == 125 {
        return true;
    }
    let first = stderr.trim_start().lines().next().unwrap_or("");
    ["Error response from daemon:", "Error: No such container", "OCI runtime exec failed"]
        .iter()
        .any(|prefix| first.starts_with(prefix))
}

/// Turn a finished `exec` into the command's output or an engine failure
///
/// A nonzero exit from the command itself is output, not an error.
pub(crate) fn exec_outcome(
    name: &str,
    stdout: String,
    stderr: String,
    exit_code: i32,
) -> Result<ExecOutput> {
    if is_engine_error(exit_code, &stderr) {
        return Err(AtelierError::CommandFailed(format!(
            "exec in {}: {}",
            name,
            stderr.trim()
        )));
    }
    Ok(ExecOutput {
        stdout,
        stderr,
        exit_code,
    })
}

/// `0.15%` → 0.15
fn parse_cpu(raw: &str) -> Option<f64> {
    raw.trim().trim_end_matches('%').trim().parse().ok()
}

/// `12.5MiB` / `1.2GB` / `512kB` → bytes
fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let number: f64 = number.parse().ok()?;
    let factor: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * factor) as u64)
}

/// `docker stats` line formatted as `<cpu>|<used> / <limit>`
fn parse_stats(line: &str) -> ResourceSnapshot {
    let mut parts = line.splitn(2, '|');
    let cpu_percent = parts.next().and_then(parse_cpu);
    let memory_bytes = parts
        .next()
        .and_then(|usage| usage.split('/').next())
        .and_then(parse_size);
    ResourceSnapshot {
        cpu_percent,
        memory_bytes,
        disk_bytes: None,
    }
}

fn format_cpus(cpus: f64) -> String {
    format!("{:.2}", cpus)
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn server_version(&self) -> Result<Option<String>> {
        match self
            .run_docker(&["version", "--format", "{{.Server.Version}}"])
            .await
        {
            Ok(version) if !version.is_empty() => Ok(Some(version)),
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::debug!(error = %e, "container engine not usable");
                Ok(None)
            }
        }
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        let labels: Vec<String> = spec
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let mounts: Vec<String> = spec.mounts.iter().map(Mount::to_arg).collect();
        let cpus = spec.cpus.map(format_cpus);

        let mut args: Vec<&str> = vec!["run", "-d", "--name", spec.name.as_str()];
        for label in &labels {
            args.extend_from_slice(&["--label", label.as_str()]);
        }
        for pair in &env {
            args.extend_from_slice(&["-e", pair.as_str()]);
        }
        for mount in &mounts {
            args.extend_from_slice(&["-v", mount.as_str()]);
        }
        if let Some(memory) = spec.memory.as_deref() {
            args.extend_from_slice(&["--memory", memory, "--memory-swap", memory]);
        }
        if let Some(cpus) = cpus.as_deref() {
            args.extend_from_slice(&["--cpus", cpus]);
        }
        if spec.network_disabled {
            args.extend_from_slice(&["--network", "none"]);
        }
        if let Some(workdir) = spec.workdir.as_deref() {
            args.extend_from_slice(&["-w", workdir]);
        }
        args.push(spec.image.as_str());
        args.extend(spec.command.iter().map(String::as_str));

        tracing::debug!(name = %spec.name, image = %spec.image, "starting container");
        self.run_cmd(&args).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.run_cmd(&["rename", from, to]).await.map(|_| ())
    }

    async fn update_limits(
        &self,
        name: &str,
        memory: Option<&str>,
        cpus: Option<f64>,
    ) -> Result<()> {
        if memory.is_none() && cpus.is_none() {
            return Ok(());
        }
        let cpus = cpus.map(format_cpus);
        let mut args: Vec<&str> = vec!["update"];
        if let Some(memory) = memory {
            args.extend_from_slice(&["--memory", memory, "--memory-swap", memory]);
        }
        if let Some(cpus) = cpus.as_deref() {
            args.extend_from_slice(&["--cpus", cpus]);
        }
        args.push(name);
        self.run_cmd(&args).await.map(|_| ())
    }

    async fn exec(&self, name: &str, request: &ExecRequest) -> Result<ExecOutput> {
        let env: Vec<String> = request
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let mut args: Vec<&str> = vec!["exec"];
        if let Some(workdir) = request.workdir.as_deref() {
            args.extend_from_slice(&["-w", workdir]);
        }
        for pair in &env {
            args.extend_from_slice(&["-e", pair.as_str()]);
        }
        args.extend_from_slice(&[name, "sh", "-c", request.script.as_str()]);

        // Dropping the future on timeout or cancel must not leave the client behind
        let output = Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AtelierError::CommandFailed(format!("failed to exec {}: {}", self.binary, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code().unwrap_or(-1);
        exec_outcome(name, stdout, stderr, exit_code)
    }

    async fn state(&self, name: &str) -> Result<Option<ContainerState>> {
        match self
            .run_docker(&[
                "inspect",
                "-f",
                "{{.State.Running}} {{.State.ExitCode}}",
                name,
            ])
            .await
        {
            Ok(out) => {
                let mut parts = out.split_whitespace();
                let running = parts.next() == Some("true");
                let exit_code = parts.next().and_then(|c| c.parse().ok()).unwrap_or(-1);
                Ok(Some(ContainerState { running, exit_code }))
            }
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(AtelierError::CommandFailed(e)),
        }
    }

    async fn stats(&self, name: &str) -> Result<ResourceSnapshot> {
        let line = self
            .run_cmd(&[
                "stats",
                "--no-stream",
                "--format",
                "{{.CPUPerc}}|{{.MemUsage}}",
                name,
            ])
            .await?;
        Ok(parse_stats(&line))
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match self.run_docker(&["rm", "-f", name]).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(AtelierError::Teardown(e)),
        }
    }

    async fn list(&self, labels: &[String]) -> Result<Vec<String>> {
        let filters: Vec<String> = labels.iter().map(|l| format!("label={}", l)).collect();
        let mut args: Vec<&str> = vec!["ps", "-a", "--format", "{{.Names}}"];
        for filter in &filters {
            args.extend_from_slice(&["--filter", filter.as_str()]);
        }
        let out = self.run_cmd(&args).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn create_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let labels: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let mut args: Vec<&str> = vec!["volume", "create"];
        for label in &labels {
            args.extend_from_slice(&["--label", label.as_str()]);
        }
        args.push(name);
        self.run_cmd(&args).await.map(|_| ())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        match self.run_docker(&["volume", "rm", name]).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(AtelierError::Teardown(e)),
        }
    }
}
