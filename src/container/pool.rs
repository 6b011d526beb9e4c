//! Pre-warmed container pool
//!
//! At most one unclaimed instance per archetype. A claim removes the entry
//! under the lock, so two concurrent claims never receive the same container,
//! and schedules a tracked background task that starts a replacement.

use super::engine::{ContainerEngine, ContainerSpec, Mount};
use super::{KEEP_ALIVE, LABEL_ARCHETYPE, LABEL_POOL};
use crate::runtime::{EventBus, RuntimeEvent};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Settings every pooled container is started with
#[derive(Debug, Clone, Default)]
pub struct PoolTemplate {
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub network_disabled: bool,
}

/// Started container waiting for an agent
#[derive(Debug, Clone)]
pub struct PooledInstance {
    pub name: String,
    pub archetype: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
}

struct PoolInner {
    engine: Arc<dyn ContainerEngine>,
    events: EventBus,
    template: PoolTemplate,
    entries: Mutex<HashMap<String, PooledInstance>>,
    /// Archetypes with a start in flight
    starting: Mutex<HashSet<String>>,
    /// Replenishment tasks, guarded together with the token
    tasks: Mutex<(CancellationToken, Vec<JoinHandle<()>>)>,
}

#[derive(Clone)]
pub struct ContainerPool {
    inner: Arc<PoolInner>,
}

impl ContainerPool {
    pub fn new(engine: Arc<dyn ContainerEngine>, events: EventBus, template: PoolTemplate) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                engine,
                events,
                template,
                entries: Mutex::new(HashMap::new()),
                starting: Mutex::new(HashSet::new()),
                tasks: Mutex::new((CancellationToken::new(), Vec::new())),
            }),
        }
    }

    /// Accept replenishment again after a shutdown
    pub async fn reopen(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.0.is_cancelled() {
            tasks.0 = CancellationToken::new();
        }
    }

    /// Start an instance for `archetype` unless one is waiting or starting
    pub async fn warm(&self, archetype: &str, image: &str) -> Result<()> {
        if self.inner.entries.lock().await.contains_key(archetype) {
            return Ok(());
        }
        if !self.inner.starting.lock().await.insert(archetype.to_string()) {
            return Ok(());
        }

        let result = self.start_instance(archetype, image).await;
        if let Ok(instance) = &result {
            tracing::info!(archetype, name = %instance.name, "Pool instance ready");
            self.inner
                .entries
                .lock()
                .await
                .insert(archetype.to_string(), instance.clone());
        }
        // Cleared only once the entry is visible, so no second start slips in
        self.inner.starting.lock().await.remove(archetype);
        result.map(|_| ())
    }

    async fn start_instance(&self, archetype: &str, image: &str) -> Result<PooledInstance> {
        let name = format!("atelier-pool-{}-{:04x}", archetype, rand::random::<u16>());
        let mut labels = self.inner.template.labels.clone();
        labels.insert(LABEL_POOL.to_string(), "true".to_string());
        labels.insert(LABEL_ARCHETYPE.to_string(), archetype.to_string());

        let spec = ContainerSpec {
            name: name.clone(),
            image: image.to_string(),
            labels,
            mounts: self.inner.template.mounts.clone(),
            network_disabled: self.inner.template.network_disabled,
            command: KEEP_ALIVE.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };

        if let Err(e) = self.inner.engine.run(&spec).await {
            // A half-created container would otherwise block the name
            let _ = self.inner.engine.remove(&name).await;
            return Err(e);
        }
        Ok(PooledInstance {
            name,
            archetype: archetype.to_string(),
            image: image.to_string(),
            created_at: Utc::now(),
        })
    }

    /// Take the waiting instance for `archetype` if it runs `image`
    pub async fn claim(&self, archetype: &str, image: &str) -> Option<PooledInstance> {
        let instance = {
            let mut entries = self.inner.entries.lock().await;
            let pooled_image = entries.get(archetype)?.image.clone();
            if pooled_image != image {
                tracing::debug!(
                    archetype,
                    pooled = %pooled_image,
                    requested = %image,
                    "pooled image does not match"
                );
                return None;
            }
            entries.remove(archetype)?
        };

        tracing::debug!(archetype, name = %instance.name, "Claimed pool instance");
        self.schedule_replenish(archetype, image).await;
        Some(instance)
    }

    /// Fire-and-forget start of a replacement instance
    pub async fn schedule_replenish(&self, archetype: &str, image: &str) {
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.0.is_cancelled() {
            return;
        }
        tasks.1.retain(|task| !task.is_finished());

        let pool = self.clone();
        let archetype = archetype.to_string();
        let image = image.to_string();
        tasks.1.push(tokio::spawn(async move {
            match pool.warm(&archetype, &image).await {
                Ok(()) => pool
                    .inner
                    .events
                    .emit(RuntimeEvent::PoolReplenished { archetype }),
                Err(e) => {
                    tracing::warn!(archetype = %archetype, error = %e, "pool replenishment failed");
                    pool.inner.events.emit(RuntimeEvent::PoolReplenishFailed {
                        archetype,
                        error: e.to_string(),
                    });
                }
            }
        }));
    }

    pub async fn contains(&self, archetype: &str) -> bool {
        self.inner.entries.lock().await.contains_key(archetype)
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    pub async fn instance_names(&self) -> Vec<String> {
        self.inner
            .entries
            .lock()
            .await
            .values()
            .map(|i| i.name.clone())
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.entries.lock().await.is_empty()
    }

    /// Wait for every replenishment scheduled so far
    pub async fn wait_idle(&self) {
        let pending = std::mem::take(&mut self.inner.tasks.lock().await.1);
        for task in pending {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "pool task failed");
            }
        }
    }

    /// Stop replenishing, wait for in-flight starts and remove every instance
    pub async fn shutdown(&self) -> Result<()> {
        let pending = {
            let mut tasks = self.inner.tasks.lock().await;
            tasks.0.cancel();
            std::mem::take(&mut tasks.1)
        };
        for task in pending {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "pool task failed");
            }
        }

        let instances: Vec<PooledInstance> =
            self.inner.entries.lock().await.drain().map(|(_, i)| i).collect();
        let mut first_error = None;
        for instance in instances {
            if let Err(e) = self.inner.engine.remove(&instance.name).await {
                tracing::warn!(name = %instance.name, error = %e, "failed to remove pool instance");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
