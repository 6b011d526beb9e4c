//! RuntimeRegistry - the compiled-in backends and which of them work here.
//!
//! Registration is static: every backend is registered at construction and the
//! availability probe is the only thing deciding whether it can be selected.

use super::{EventBus, RuntimeBackend, RuntimeKind};
use crate::config::RuntimeConfig;
use crate::container::ContainerBackend;
use crate::session::MultiplexedBackend;
use crate::{AtelierError, Result};
use std::sync::Arc;

pub struct RuntimeRegistry {
    backends: Vec<Arc<dyn RuntimeBackend>>,
    detected: bool,
}

impl RuntimeRegistry {
    /// Empty registry; see [`RuntimeRegistry::with_defaults`]
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
            detected: false,
        }
    }

    /// Registry holding every backend this build ships with
    pub fn with_defaults(config: &RuntimeConfig, events: &EventBus) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ContainerBackend::new(config, events.clone())));
        registry.register(Arc::new(MultiplexedBackend::new(config, events.clone())));
        registry
    }

    /// Add a backend; a second backend of the same kind is ignored
    pub fn register(&mut self, backend: Arc<dyn RuntimeBackend>) {
        let kind = backend.kind();
        if self.get(kind).is_some() {
            tracing::warn!(runtime = %kind, "runtime already registered, ignoring");
            return;
        }
        self.backends.push(backend);
    }

    /// Probe every backend concurrently and drop the unavailable ones
    ///
    /// A probe that errors or panics counts as unavailable. Fails with
    /// `BackendUnavailable` when nothing is left.
    pub async fn detect_available_runtimes(&mut self) -> Result<Vec<RuntimeKind>> {
        let probes: Vec<_> = self
            .backends
            .iter()
            .map(|backend| {
                let backend = backend.clone();
                let kind = backend.kind();
                (
                    kind,
                    tokio::spawn(async move { backend.check_availability().await }),
                )
            })
            .collect();

        let mut available = Vec::new();
        for (kind, probe) in probes {
            match probe.await {
                Ok(Ok(true)) => {
                    tracing::info!(runtime = %kind, "runtime available");
                    available.push(kind);
                }
                Ok(Ok(false)) => tracing::info!(runtime = %kind, "runtime not available"),
                Ok(Err(e)) => {
                    tracing::warn!(runtime = %kind, error = %e, "availability probe failed")
                }
                Err(e) => tracing::warn!(runtime = %kind, error = %e, "availability probe panicked"),
            }
        }

        self.backends.retain(|b| available.contains(&b.kind()));
        self.detected = true;

        if available.is_empty() {
            return Err(AtelierError::BackendUnavailable(
                "no runtime backend is available on this host".to_string(),
            ));
        }
        Ok(available)
    }

    pub fn get(&self, kind: RuntimeKind) -> Option<Arc<dyn RuntimeBackend>> {
        self.backends.iter().find(|b| b.kind() == kind).cloned()
    }

    /// Registered kinds; after detection only the available ones
    pub fn kinds(&self) -> Vec<RuntimeKind> {
        self.backends.iter().map(|b| b.kind()).collect()
    }

    pub fn backends(&self) -> &[Arc<dyn RuntimeBackend>] {
        &self.backends
    }

    pub fn is_detected(&self) -> bool {
        self.detected
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
