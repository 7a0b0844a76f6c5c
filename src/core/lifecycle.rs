//! Mounts and unmounts project stores.
//!
//! A project is mounted while it is both active in the registry and known to
//! the project directory. Mounting wires the local persister, the remote
//! synchronizer and the aggregate updater, then publishes the handle in the
//! store cache. Unmounting reverses that without touching persisted or
//! remote data. Only `purge` deletes data.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::binding::remote::{RemoteSynchronizer, SyncTransport, delete_remote};
use crate::binding::LocalPersister;
use crate::config::{AppConfig, SyncConfig};
use crate::core::aggregate::{AggregateUpdater, seed_from_template};
use crate::core::cache::StoreCache;
use crate::core::directory::ProjectDirectory;
use crate::core::registry::ActiveEntityRegistry;
use crate::core::store::{Store, StoreId};
use crate::error::OpResult;
use crate::remote::accounting::{self, AccountingClient};

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub stores_dir: PathBuf,
    pub prefix: String,
    pub sync: SyncConfig,
    pub accounting_debounce: Duration,
}

impl LifecycleSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            stores_dir: config.stores_dir(),
            prefix: config.stores.prefix.clone(),
            sync: config.sync.clone(),
            accounting_debounce: config.accounting.debounce(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub mounted: Vec<String>,
    pub unmounted: Vec<String>,
    pub failed: Vec<String>,
}

struct MountedStore {
    persister: LocalPersister,
    synchronizer: RemoteSynchronizer,
    aggregates: AggregateUpdater,
    accounting: JoinHandle<()>,
}

struct Inner {
    settings: LifecycleSettings,
    registry: Arc<ActiveEntityRegistry>,
    directory: Arc<ProjectDirectory>,
    cache: Arc<StoreCache>,
    transport: Arc<dyn SyncTransport>,
    accounting: Arc<dyn AccountingClient>,
    /// Held for the whole of a reconcile or purge so two of them never
    /// interleave around the same project.
    mounted: Mutex<BTreeMap<String, MountedStore>>,
}

#[derive(Clone)]
pub struct StoreLifecycleController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StoreLifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLifecycleController")
            .field("settings", &self.inner.settings)
            .finish()
    }
}

/// Running watcher started by [`StoreLifecycleController::start`].
#[derive(Debug)]
pub struct LifecycleHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LifecycleHandle {
    /// Stop watching and detach every mounted store.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await
            && e.is_panic()
        {
            error!("lifecycle watcher panicked");
        }
    }
}

impl StoreLifecycleController {
    pub fn new(
        settings: LifecycleSettings,
        registry: Arc<ActiveEntityRegistry>,
        directory: Arc<ProjectDirectory>,
        cache: Arc<StoreCache>,
        transport: Arc<dyn SyncTransport>,
        accounting: Arc<dyn AccountingClient>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                registry,
                directory,
                cache,
                transport,
                accounting,
                mounted: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn store_id(&self, entity_id: &str) -> StoreId {
        StoreId::per_entity(&self.inner.settings.prefix, entity_id)
    }

    pub async fn mounted_ids(&self) -> Vec<String> {
        self.inner.mounted.lock().await.keys().cloned().collect()
    }

    /// Reconcile now, then again whenever the registry or the directory
    /// changes.
    pub fn start(&self) -> LifecycleHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let controller = self.clone();
        let task = tokio::spawn(async move {
            let mut active = controller.inner.registry.subscribe();
            let mut projects = controller.inner.directory.subscribe();
            loop {
                controller.reconcile().await;
                tokio::select! {
                    changed = active.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = projects.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            controller.detach_all().await;
        });
        LifecycleHandle { shutdown, task }
    }

    /// Bring mounted stores in line with active ∩ known.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut mounted = self.inner.mounted.lock().await;
        let desired: BTreeSet<String> = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .filter(|id| self.inner.directory.contains(id))
            .collect();

        let mut report = ReconcileReport::default();
        let stale: Vec<String> = mounted
            .keys()
            .filter(|id| !desired.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(entry) = mounted.remove(&id) {
                self.detach(&id, entry).await;
                report.unmounted.push(id);
            }
        }

        for id in desired {
            if mounted.contains_key(&id) {
                continue;
            }
            match self.mount(&id).await {
                Ok(entry) => {
                    mounted.insert(id.clone(), entry);
                    report.mounted.push(id);
                }
                Err(e) => {
                    error!(entity_id = %id, error = %e, "failed to mount store");
                    report.failed.push(id);
                }
            }
        }
        report
    }

    /// Delete a project's local and remote store data. Works whether or not
    /// the store is currently mounted; deleting twice is harmless.
    pub async fn purge(&self, entity_id: &str) -> OpResult {
        self.inner.registry.remove(entity_id);
        let store_id = self.store_id(entity_id);
        let mut mounted = self.inner.mounted.lock().await;

        let (local, remote) = match mounted.remove(entity_id) {
            Some(entry) => {
                self.inner.cache.remove(entity_id);
                entry.aggregates.detach();
                entry.accounting.abort();
                let remote = entry.synchronizer.purge().await.map_err(|e| e.to_string());
                let local = entry.persister.purge().await.map_err(|e| e.to_string());
                (local, remote)
            }
            None => {
                let local = LocalPersister::purge_files(&self.inner.settings.stores_dir, &store_id)
                    .await
                    .map_err(|e| e.to_string());
                let remote = delete_remote(self.inner.transport.as_ref(), &store_id)
                    .await
                    .map_err(|e| e.to_string());
                (local, remote)
            }
        };
        drop(mounted);

        match (local, remote) {
            (Ok(()), Ok(())) => {
                info!(entity_id = %entity_id, "project store purged");
                OpResult::success(entity_id)
            }
            (Err(e), _) => OpResult::failed(entity_id, format!("local deletion failed: {}", e)),
            (Ok(()), Err(e)) => {
                OpResult::failed(entity_id, format!("remote deletion failed: {}", e))
            }
        }
    }

    /// Detach every mounted store without deleting anything.
    pub async fn detach_all(&self) {
        let mut mounted = self.inner.mounted.lock().await;
        let entries = std::mem::take(&mut *mounted);
        for (id, entry) in entries {
            self.detach(&id, entry).await;
        }
    }

    async fn mount(&self, entity_id: &str) -> anyhow::Result<MountedStore> {
        let inner = &self.inner;
        let info = inner
            .directory
            .get(entity_id)
            .ok_or_else(|| anyhow::anyhow!("project {} is not in the directory", entity_id))?;
        let store = Store::new(self.store_id(entity_id));

        let aggregates = AggregateUpdater::attach(&store);
        let persister = match LocalPersister::attach(
            &store,
            &inner.settings.stores_dir,
            info.initial_content.as_deref(),
        )
        .await
        {
            Ok(persister) => persister,
            Err(e) => {
                aggregates.detach();
                return Err(e);
            }
        };

        if let Some(template) = &info.starter_template {
            let seeded = seed_from_template(&store, template);
            inner.directory.clear_starter_template(entity_id);
            if seeded > 0 {
                info!(
                    entity_id = %entity_id,
                    rows = seeded,
                    "seeded work items from starter template"
                );
            }
        }

        let synchronizer =
            RemoteSynchronizer::start(&store, inner.transport.clone(), &inner.settings.sync);
        let accounting = accounting::spawn_for_project(
            inner.accounting.clone(),
            inner.directory.clone(),
            entity_id.to_string(),
            inner.settings.accounting_debounce,
        );

        inner
            .cache
            .put_persisted(entity_id, store.clone(), persister.flush_handle());
        info!(entity_id = %entity_id, store_id = %store.id(), "store mounted");
        Ok(MountedStore {
            persister,
            synchronizer,
            aggregates,
            accounting,
        })
    }

    async fn detach(&self, entity_id: &str, entry: MountedStore) {
        self.inner.cache.remove(entity_id);
        entry.aggregates.detach();
        entry.accounting.abort();
        entry.synchronizer.detach().await;
        entry.persister.detach().await;
        info!(entity_id = %entity_id, "store unmounted");
    }
}
