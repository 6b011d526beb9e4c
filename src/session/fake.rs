//! Scripted multiplexer for backend tests
//!
//! Framed commands complete immediately with output `ok` unless the command
//! text contains `sleep`, in which case the pane never shows the end sentinel.
//! Commands containing `false` exit with status 1.

use super::Multiplexer;
use crate::{AtelierError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxCall {
    NewSession(String),
    SendLine(String, String),
    Interrupt(String),
    Kill(String),
}

#[derive(Default)]
struct FakeSession {
    screen: String,
    cwd: PathBuf,
    env: Vec<(String, String)>,
}

pub struct FakeMultiplexer {
    available: bool,
    fail_kills: AtomicBool,
    sessions: Mutex<HashMap<String, FakeSession>>,
    calls: Mutex<Vec<MuxCall>>,
}

impl FakeMultiplexer {
    pub fn new() -> Self {
        Self {
            available: true,
            fail_kills: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Pretend sessions left over from an earlier process exist
    pub fn with_sessions(self, names: &[&str]) -> Self {
        {
            let mut sessions = self.sessions.lock().unwrap();
            for name in names {
                sessions.insert(name.to_string(), FakeSession::default());
            }
        }
        self
    }

    /// A leftover session tagged with the root that started it
    pub fn with_owned_session(self, name: &str, key: &str, root: &str) -> Self {
        self.sessions.lock().unwrap().insert(
            name.to_string(),
            FakeSession {
                env: vec![(key.to_string(), root.to_string())],
                ..FakeSession::default()
            },
        );
        self
    }

    pub fn fail_kills(&self, fail: bool) {
        self.fail_kills.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<MuxCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn session_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn session_env(&self, name: &str) -> Vec<(String, String)> {
        self.sessions
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.env.clone())
            .unwrap_or_default()
    }

    pub fn session_cwd(&self, name: &str) -> Option<PathBuf> {
        self.sessions.lock().unwrap().get(name).map(|s| s.cwd.clone())
    }

    /// Simulate the shell exiting
    pub fn end_session(&self, name: &str) {
        self.sessions.lock().unwrap().remove(name);
    }

    fn record(&self, call: MuxCall) {
        self.calls.lock().unwrap().push(call);
    }
}

/// Sequence number out of `__atelier_begin_<n>__`
fn frame_seq(text: &str) -> Option<u64> {
    let rest = text.split("__atelier_begin_").nth(1)?;
    rest.split("__").next()?.parse().ok()
}

#[async_trait]
impl Multiplexer for FakeMultiplexer {
    async fn version(&self) -> Result<Option<String>> {
        Ok(self.available.then(|| "tmux 3.4".to_string()))
    }

    async fn new_session(&self, name: &str, cwd: &Path, env: &[(String, String)]) -> Result<()> {
        self.record(MuxCall::NewSession(name.to_string()));
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(name) {
            return Err(AtelierError::CommandFailed(format!(
                "duplicate session: {}",
                name
            )));
        }
        sessions.insert(
            name.to_string(),
            FakeSession {
                screen: "$ ".to_string(),
                cwd: cwd.to_path_buf(),
                env: env.to_vec(),
            },
        );
        Ok(())
    }

    async fn has_session(&self, name: &str) -> Result<bool> {
        Ok(self.sessions.lock().unwrap().contains_key(name))
    }

    async fn send_line(&self, name: &str, text: &str) -> Result<()> {
        self.record(MuxCall::SendLine(name.to_string(), text.to_string()));
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(name)
            .ok_or_else(|| AtelierError::CommandFailed(format!("can't find session: {}", name)))?;

        session.screen.push_str(text);
        session.screen.push('\n');
        if text.contains("sleep") {
            return Ok(());
        }
        if let Some(seq) = frame_seq(text) {
            let code = if text.contains("false") { 1 } else { 0 };
            session.screen.push_str(&format!(
                "__atelier_begin_{seq}__\nok\n__atelier_end_{seq}__:{code}\n$ "
            ));
        }
        Ok(())
    }

    async fn interrupt(&self, name: &str) -> Result<()> {
        self.record(MuxCall::Interrupt(name.to_string()));
        if let Some(session) = self.sessions.lock().unwrap().get_mut(name) {
            session.screen.push_str("^C\n$ ");
        }
        Ok(())
    }

    async fn capture(&self, name: &str, _history: usize) -> Result<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.screen.clone())
            .ok_or_else(|| AtelierError::CommandFailed(format!("can't find session: {}", name)))
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        self.record(MuxCall::Kill(name.to_string()));
        if self.fail_kills.load(Ordering::SeqCst) {
            return Err(AtelierError::Teardown(format!(
                "tmux kill-session failed: server busy ({})",
                name
            )));
        }
        self.sessions.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(self.session_names())
    }

    async fn session_var(&self, name: &str, key: &str) -> Result<Option<String>> {
        Ok(self.session_env(name).into_iter().find(|(k, _)| k == key).map(|(_, v)| v))
    }
}
