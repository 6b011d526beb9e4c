//! Agent activity log
//!
//! Appends every command and its output to `state/agent.log` inside the agent
//! workspace. The file belongs to the workspace contract, so it outlives the
//! in-memory session and can be read by other collaborators after teardown.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::Result;

/// Log file name inside the agent's `state/` directory
pub const AGENT_LOG_FILE: &str = "agent.log";

/// Append-only log for a single agent
pub struct AgentLogger {
    file: File,
    path: PathBuf,
    bytes_written: usize,
}

impl AgentLogger {
    /// Open (or create) the log under `<workspace>/state/`
    ///
    /// Opened in append mode so a reset agent keeps its history.
    pub fn open(workspace: &Path) -> Result<Self> {
        let state_dir = workspace.join("state");
        fs::create_dir_all(&state_dir)?;
        let path = state_dir.join(AGENT_LOG_FILE);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        tracing::debug!("Agent logger opened at {:?}", path);

        Ok(Self {
            file,
            path,
            bytes_written: 0,
        })
    }

    /// Append one timestamped line
    pub fn line(&mut self, message: &str) -> Result<()> {
        let stamped = format!("[{}] {}\n", Utc::now().to_rfc3339(), message);
        self.write(stamped.as_bytes())
    }

    /// Append raw output, ANSI escape codes preserved
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.bytes_written += data.len();
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended through this handle
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

impl Drop for AgentLogger {
    fn drop(&mut self) {
        // Best-effort flush on drop
        let _ = self.file.flush();
        tracing::debug!(
            "Agent log {:?} closed ({} bytes written)",
            self.path,
            self.bytes_written
        );
    }
}
