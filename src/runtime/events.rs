//! Runtime events
//!
//! Progress reporting for the orchestration layer. Emission never blocks and
//! never fails; a bus without subscribers simply drops events.

use super::{Capabilities, RuntimeKind, RuntimePreference};
use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    Initialized {
        runtime: RuntimeKind,
        available: Vec<RuntimeKind>,
    },
    RuntimeSelected {
        runtime: RuntimeKind,
        preference: RuntimePreference,
        capabilities: Capabilities,
    },
    RuntimeSwitched {
        from: RuntimeKind,
        to: RuntimeKind,
        before: Capabilities,
        after: Capabilities,
    },
    AgentCreated {
        agent_id: String,
        team_id: String,
        runtime: RuntimeKind,
        pooled: bool,
        warnings: usize,
    },
    CommandExecuted {
        agent_id: String,
        exit_code: i32,
        duration_ms: u64,
    },
    CommandTimedOut {
        agent_id: String,
        timeout_ms: u64,
    },
    AgentReset {
        agent_id: String,
    },
    AgentDestroyed {
        agent_id: String,
        team_id: String,
    },
    FilesTransferred {
        from: String,
        to: String,
        copied: usize,
        failed: usize,
    },
    TeamCreated {
        team_id: String,
    },
    TeamDestroyed {
        team_id: String,
    },
    PoolReplenished {
        archetype: String,
    },
    PoolReplenishFailed {
        archetype: String,
        error: String,
    },
    ShutdownComplete,
}

/// Broadcast channel shared by the manager and every backend
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: RuntimeEvent) {
        tracing::debug!(?event, "runtime event");
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
