//! Host workspace layout shared by every runtime backend.
//!
//! ```text
//! <root>/teams/<team>/shared/
//! <root>/teams/<team>/agents/<agent>/output/
//! <root>/teams/<team>/agents/<agent>/handoffs/
//! <root>/teams/<team>/agents/<agent>/state/
//! ```
//!
//! Both backends keep agent files on the host under this tree: tmux sessions
//! run in it directly, containers see it through a bind mount.

mod workshop;

pub use workshop::Workshop;

use crate::agent::{AgentIdentity, TransferFailure, TransferReport};
use crate::{AtelierError, Result};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

pub const OUTPUT_DIR: &str = "output";
pub const HANDOFFS_DIR: &str = "handoffs";
pub const STATE_DIR: &str = "state";
pub const SHARED_DIR: &str = "shared";
pub const IDENTITY_FILE: &str = "identity.json";

/// Directories every agent workspace contains
pub const AGENT_DIRS: [&str; 3] = [OUTPUT_DIR, HANDOFFS_DIR, STATE_DIR];

/// Upper bound on files reported by a status poll
const MAX_LISTED_FILES: usize = 500;

/// Paths of the workspace tree under one root
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn team_dir(&self, team_id: &str) -> PathBuf {
        self.root.join("teams").join(team_id)
    }

    pub fn shared_dir(&self, team_id: &str) -> PathBuf {
        self.team_dir(team_id).join(SHARED_DIR)
    }

    pub fn agent_dir(&self, team_id: &str, agent_id: &str) -> PathBuf {
        self.team_dir(team_id).join("agents").join(agent_id)
    }

    /// `path` relative to the root, if it lives under it
    pub fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.root).ok()
    }

    pub async fn prepare_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Create the team directory and its shared handoff area
    pub async fn prepare_team(&self, team_id: &str) -> Result<(PathBuf, PathBuf)> {
        let shared = self.shared_dir(team_id);
        tokio::fs::create_dir_all(&shared).await?;
        Ok((self.team_dir(team_id), shared))
    }

    /// Create an agent directory, seeded from `seed` when given
    ///
    /// An existing directory is reused so a recreated agent keeps its files.
    pub async fn prepare_agent(
        &self,
        team_id: &str,
        agent_id: &str,
        seed: Option<&Path>,
    ) -> Result<PathBuf> {
        let dir = self.agent_dir(team_id, agent_id);
        tokio::fs::create_dir_all(&dir).await?;

        if let Some(seed) = seed {
            if !seed.is_dir() {
                return Err(AtelierError::ProvisionFailure(format!(
                    "project path {} is not a directory",
                    seed.display()
                )));
            }
            let (src, dst) = (seed.to_path_buf(), dir.clone());
            let copied = tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
                .await
                .map_err(|e| AtelierError::ProvisionFailure(format!("seed copy panicked: {}", e)))??;
            tracing::debug!(agent_id, files = copied, "Seeded workspace from {:?}", seed);
        }
        Ok(dir)
    }
}

/// Create `output/`, `handoffs/` and `state/` inside an agent directory
pub async fn create_agent_dirs(dir: &Path) -> Result<()> {
    for name in AGENT_DIRS {
        tokio::fs::create_dir_all(dir.join(name)).await?;
    }
    Ok(())
}

/// Write `state/identity.json`
pub async fn write_identity(dir: &Path, identity: &AgentIdentity) -> Result<()> {
    let state = dir.join(STATE_DIR);
    tokio::fs::create_dir_all(&state).await?;
    let json = serde_json::to_vec_pretty(identity)?;
    tokio::fs::write(state.join(IDENTITY_FILE), json).await?;
    Ok(())
}

/// A handoff file name must stay inside `output/` and `handoffs/`
fn is_safe_relative(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        && path.components().any(|c| matches!(c, Component::Normal(_)))
}

/// Copy `<from>/output/<file>` to `<to>/handoffs/<file>` for each file
///
/// Files are handled independently: a failure is recorded and the rest still
/// copy. Each copy lands under a temporary name and is renamed into place, so
/// the receiver never sees a half-written file.
pub async fn transfer_files(from_dir: &Path, to_dir: &Path, files: &[String]) -> TransferReport {
    let mut report = TransferReport::default();

    for file in files {
        match transfer_one(from_dir, to_dir, file).await {
            Ok(()) => report.copied.push(file.clone()),
            Err(e) => {
                tracing::warn!(file = %file, error = %e, "handoff copy failed");
                report.failed.push(TransferFailure {
                    file: file.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
    report
}

async fn transfer_one(from_dir: &Path, to_dir: &Path, file: &str) -> Result<()> {
    if !is_safe_relative(file) {
        return Err(AtelierError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("file name '{}' escapes the workspace", file),
        )));
    }

    let src = from_dir.join(OUTPUT_DIR).join(file);
    let dst = to_dir.join(HANDOFFS_DIR).join(file);
    let parent = dst.parent().unwrap_or(to_dir);
    tokio::fs::create_dir_all(parent).await?;

    let file_name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let partial = parent.join(format!(".{}.partial", file_name));

    if let Err(e) = tokio::fs::copy(&src, &partial).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e.into());
    }
    tokio::fs::rename(&partial, &dst).await?;
    Ok(())
}

/// Files under `dir`, relative to it, sorted
pub async fn list_files(dir: &Path) -> Result<Vec<String>> {
    let dir = dir.to_path_buf();
    let files = tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        walk(&dir, &dir, &mut files)?;
        files.sort();
        files.truncate(MAX_LISTED_FILES);
        Ok::<_, io::Error>(files)
    })
    .await
    .map_err(|e| AtelierError::Io(io::Error::other(e)))??;
    Ok(files)
}

fn walk(base: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(base, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(rel) = path.strip_prefix(base) {
                out.push(rel.to_string_lossy().into_owned());
            }
        }
        if out.len() > MAX_LISTED_FILES {
            break;
        }
    }
    Ok(())
}

/// Total size of regular files under `dir`; 0 for a missing directory
pub async fn disk_usage(dir: &Path) -> u64 {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || tree_size(&dir).unwrap_or(0))
        .await
        .unwrap_or(0)
}

fn tree_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += tree_size(&entry.path()).unwrap_or(0);
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Recursive copy skipping `.git`; returns the number of files copied
fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let file_type = entry.file_type()?;
        let target = dst.join(&name);
        if file_type.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
