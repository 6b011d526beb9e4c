//! Terminal multiplexer seam and its tmux CLI implementation

use crate::{AtelierError, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

/// Minimum tmux release with `new-session -e`
const MIN_VERSION: (u32, u32) = (3, 2);

/// Session operations the multiplexed backend needs
#[async_trait]
pub trait Multiplexer: Send + Sync + 'static {
    /// Version string, `None` when the binary is missing or unusable
    async fn version(&self) -> Result<Option<String>>;

    async fn new_session(&self, name: &str, cwd: &Path, env: &[(String, String)]) -> Result<()>;

    async fn has_session(&self, name: &str) -> Result<bool>;

    /// Type `text` literally, then press Enter
    async fn send_line(&self, name: &str, text: &str) -> Result<()>;

    /// Send C-c to the foreground process
    async fn interrupt(&self, name: &str) -> Result<()>;

    /// Pane contents including `history` lines of scrollback
    async fn capture(&self, name: &str, history: usize) -> Result<String>;

    /// Missing sessions are not an error
    async fn kill_session(&self, name: &str) -> Result<()>;

    async fn list_sessions(&self) -> Result<Vec<String>>;

    /// Value of a session environment variable; `None` when unset or the
    /// session is gone
    async fn session_var(&self, name: &str, key: &str) -> Result<Option<String>>;
}

/// `tmux` driven through its command line
pub struct TmuxCli {
    binary: String,
}

impl TmuxCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run_tmux(&self, args: &[&str]) -> std::result::Result<String, String> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.binary, e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "tmux {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            ))
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        self.run_tmux(args).await.map_err(AtelierError::CommandFailed)
    }
}

/// Exact-match target so `atelier-a1` never resolves to `atelier-a10`
fn exact(name: &str) -> String {
    format!("={}", name)
}

fn is_missing(err: &str) -> bool {
    err.contains("can't find session")
        || err.contains("no server running")
        || err.contains("session not found")
        || err.contains("error connecting")
}

/// `KEY=value` from `show-environment`; `-KEY` marks a removed variable
fn parse_env_line(out: &str, key: &str) -> Option<String> {
    out.lines()
        .find_map(|line| line.trim_end().strip_prefix(key)?.strip_prefix('='))
        .map(str::to_string)
}

/// Parse `tmux 3.3a` / `tmux next-3.4` into (major, minor)
fn parse_version(raw: &str) -> Option<(u32, u32)> {
    let version = raw.split_whitespace().nth(1)?;
    let version = version.trim_start_matches(|c: char| !c.is_ascii_digit());
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor_digits: String = parts
        .next()
        .unwrap_or("0")
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    let minor = minor_digits.parse().unwrap_or(0);
    Some((major, minor))
}

#[async_trait]
impl Multiplexer for TmuxCli {
    async fn version(&self) -> Result<Option<String>> {
        let raw = match self.run_tmux(&["-V"]).await {
            Ok(raw) => raw.trim().to_string(),
            Err(e) => {
                tracing::debug!(error = %e, "tmux not usable");
                return Ok(None);
            }
        };
        match parse_version(&raw) {
            Some(version) if version >= MIN_VERSION => Ok(Some(raw)),
            Some(_) => {
                tracing::warn!(version = %raw, "tmux is older than 3.2");
                Ok(None)
            }
            None => {
                tracing::warn!(version = %raw, "unrecognised tmux version");
                Ok(None)
            }
        }
    }

    async fn new_session(&self, name: &str, cwd: &Path, env: &[(String, String)]) -> Result<()> {
        let cwd = cwd.to_string_lossy();
        let pairs: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let mut args: Vec<&str> = vec![
            "new-session",
            "-d",
            "-s",
            name,
            "-c",
            cwd.as_ref(),
            "-x",
            "200",
            "-y",
            "50",
        ];
        for pair in &pairs {
            args.push("-e");
            args.push(pair.as_str());
        }
        self.run(&args).await.map(|_| ())
    }

    async fn has_session(&self, name: &str) -> Result<bool> {
        match self.run_tmux(&["has-session", "-t", &exact(name)]).await {
            Ok(_) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(AtelierError::CommandFailed(e)),
        }
    }

    async fn send_line(&self, name: &str, text: &str) -> Result<()> {
        self.run(&["send-keys", "-t", name, "-l", text]).await?;
        self.run(&["send-keys", "-t", name, "Enter"]).await.map(|_| ())
    }

    async fn interrupt(&self, name: &str) -> Result<()> {
        self.run(&["send-keys", "-t", name, "C-c"]).await.map(|_| ())
    }

    async fn capture(&self, name: &str, history: usize) -> Result<String> {
        let start = format!("-{}", history);
        self.run(&["capture-pane", "-p", "-J", "-t", name, "-S", &start])
            .await
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        match self.run_tmux(&["kill-session", "-t", &exact(name)]).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(AtelierError::Teardown(e)),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        match self
            .run_tmux(&["list-sessions", "-F", "#{session_name}"])
            .await
        {
            Ok(out) => Ok(out
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if is_missing(&e) => Ok(Vec::new()),
            Err(e) => Err(AtelierError::CommandFailed(e)),
        }
    }

    async fn session_var(&self, name: &str, key: &str) -> Result<Option<String>> {
        match self
            .run_tmux(&["show-environment", "-t", &exact(name), key])
            .await
        {
            Ok(out) => Ok(parse_env_line(&out, key)),
            Err(e) if is_missing(&e) || e.contains("unknown variable") => Ok(None),
            Err(e) => Err(AtelierError::CommandFailed(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("tmux 3.3a"), Some((3, 3)));
        assert_eq!(parse_version("tmux 3.2"), Some((3, 2)));
        assert_eq!(parse_version("tmux next-3.5"), Some((3, 5)));
        assert_eq!(parse_version("tmux 2.9a"), Some((2, 9)));
        assert_eq!(parse_version("tmux"), None);
        assert!(parse_version("tmux 3.1c").unwrap() < MIN_VERSION);
    }

    #[test]
    fn test_parse_env_line() {
        assert_eq!(
            parse_env_line("ATELIER_SESSION_ROOT=/srv/atelier\n", "ATELIER_SESSION_ROOT"),
            Some("/srv/atelier".to_string())
        );
        assert_eq!(parse_env_line("-ATELIER_SESSION_ROOT\n", "ATELIER_SESSION_ROOT"), None);
        assert_eq!(parse_env_line("ATELIER_SESSION_ROOTS=x\n", "ATELIER_SESSION_ROOT"), None);
    }

    #[test]
    fn test_missing_session_errors() {
        assert!(is_missing("tmux has-session failed: can't find session: =atelier-a1"));
        assert!(is_missing("no server running on /tmp/tmux-0/default"));
        assert!(!is_missing("unknown option -- z"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let tmux = TmuxCli::new("/nonexistent/tmux-binary");
        assert!(tmux.version().await.unwrap().is_none());
    }
}
