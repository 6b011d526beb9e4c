//! RuntimeSelector - picks and switches the active backend.

use super::{
    EventBus, RuntimeBackend, RuntimeEvent, RuntimeKind, RuntimePreference, RuntimeRegistry,
};
use crate::{AtelierError, Result};
use std::sync::Arc;

pub struct RuntimeSelector {
    chain: Vec<RuntimeKind>,
    active: Option<Arc<dyn RuntimeBackend>>,
}

impl RuntimeSelector {
    pub fn new(chain: Vec<RuntimeKind>) -> Self {
        let mut deduped = Vec::with_capacity(chain.len());
        for kind in chain {
            if !deduped.contains(&kind) {
                deduped.push(kind);
            }
        }
        Self {
            chain: deduped,
            active: None,
        }
    }

    pub fn chain(&self) -> &[RuntimeKind] {
        &self.chain
    }

    /// Backend that `preference` resolves to given the available kinds
    ///
    /// An explicit preference that is not available falls back to the chain.
    pub fn resolve(
        &self,
        preference: RuntimePreference,
        available: &[RuntimeKind],
    ) -> Option<RuntimeKind> {
        if let RuntimePreference::Explicit(kind) = preference {
            if available.contains(&kind) {
                return Some(kind);
            }
            tracing::warn!(
                runtime = %kind,
                "preferred runtime is not available, falling back to auto"
            );
        }
        self.chain.iter().copied().find(|k| available.contains(k))
    }

    /// Resolve, initialize and activate a backend
    pub async fn select(
        &mut self,
        preference: RuntimePreference,
        registry: &RuntimeRegistry,
        events: &EventBus,
    ) -> Result<RuntimeKind> {
        let available = registry.kinds();
        let kind = self.resolve(preference, &available).ok_or_else(|| {
            AtelierError::BackendUnavailable(format!(
                "none of {:?} is available (available: {:?})",
                self.chain, available
            ))
        })?;
        let backend = registry
            .get(kind)
            .ok_or_else(|| AtelierError::BackendUnavailable(kind.to_string()))?;

        backend.initialize().await?;
        tracing::info!(runtime = %kind, %preference, "Runtime selected");
        events.emit(RuntimeEvent::RuntimeSelected {
            runtime: kind,
            preference,
            capabilities: backend.capabilities(),
        });
        self.active = Some(backend);
        Ok(kind)
    }

    /// Replace the active backend with `kind`
    ///
    /// Returns `false` when `kind` is already active. The old backend is shut
    /// down (its agents and teams go with it) before the new one initializes;
    /// if that fails the old backend is brought back.
    pub async fn switch(
        &mut self,
        kind: RuntimeKind,
        registry: &RuntimeRegistry,
        events: &EventBus,
    ) -> Result<bool> {
        if self.active_kind() == Some(kind) {
            tracing::debug!(runtime = %kind, "runtime already active");
            return Ok(false);
        }
        let next = registry.get(kind).ok_or_else(|| {
            AtelierError::BackendUnavailable(format!("{} is not available", kind))
        })?;

        if let Some(old) = &self.active {
            old.shutdown().await?;
        }
        let previous = self.active.take();

        if let Err(e) = next.initialize().await {
            tracing::error!(runtime = %kind, error = %e, "runtime failed to initialize");
            if let Some(old) = previous {
                match old.initialize().await {
                    Ok(()) => self.active = Some(old),
                    Err(restore) => {
                        tracing::error!(error = %restore, "previous runtime failed to come back")
                    }
                }
            }
            return Err(e);
        }

        if let Some(old) = &previous {
            tracing::info!(from = %old.kind(), to = %kind, "Runtime switched");
            events.emit(RuntimeEvent::RuntimeSwitched {
                from: old.kind(),
                to: kind,
                before: old.capabilities(),
                after: next.capabilities(),
            });
        } else {
            events.emit(RuntimeEvent::RuntimeSelected {
                runtime: kind,
                preference: RuntimePreference::Explicit(kind),
                capabilities: next.capabilities(),
            });
        }
        self.active = Some(next);
        Ok(true)
    }

    pub fn active(&self) -> Option<Arc<dyn RuntimeBackend>> {
        self.active.clone()
    }

    pub fn active_kind(&self) -> Option<RuntimeKind> {
        self.active.as_ref().map(|b| b.kind())
    }

    pub fn clear(&mut self) -> Option<Arc<dyn RuntimeBackend>> {
        self.active.take()
    }
}
