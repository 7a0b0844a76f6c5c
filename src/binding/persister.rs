use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::db::{StoreDb, delete_db_files};
use crate::core::store::{Change, ChangeOrigin, StoreHandle, StoreId, StoreSnapshot};

enum Control {
    Flush(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

/// Waits for a persister to catch up, without owning it.
#[derive(Debug, Clone)]
pub struct PersistFlush {
    control: mpsc::UnboundedSender<Control>,
}

impl PersistFlush {
    /// Resolves once every mutation made before the call is on disk, or at
    /// once if the persister has already stopped.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Binds a store to its on-device database: load once, then write every
/// mutation through as it happens.
#[derive(Debug)]
pub struct LocalPersister {
    store_id: StoreId,
    db: StoreDb,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl LocalPersister {
    pub fn db_path(stores_dir: &Path, store_id: &StoreId) -> PathBuf {
        stores_dir.join(format!("{}.db", store_id.file_stem()))
    }

    /// Open the store's database, load what it holds (or the seed when it
    /// holds nothing and the seed parses), then start autosaving.
    pub async fn attach(
        store: &StoreHandle,
        stores_dir: &Path,
        seed: Option<&str>,
    ) -> anyhow::Result<Self> {
        let store_id = store.id().clone();
        let db = StoreDb::open(Self::db_path(stores_dir, &store_id)).await?;

        // Subscribe before loading so rows derived during the load are saved.
        let changes = store.subscribe();

        let persisted = db.load_snapshot().await?;
        if !persisted.is_empty() {
            debug!(
                store_id = %store_id,
                records = persisted.records.len(),
                "loaded persisted store"
            );
            store.load(persisted);
        } else if let Some(seed) = seed {
            match serde_json::from_str::<StoreSnapshot>(seed) {
                Ok(snapshot) => {
                    db.write_snapshot(&snapshot).await?;
                    info!(
                        store_id = %store_id,
                        records = snapshot.records.len(),
                        "seeded empty store"
                    );
                    store.load(snapshot);
                }
                Err(e) => {
                    warn!(store_id = %store_id, error = %e, "ignoring unparseable seed content")
                }
            }
        }

        let (control, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(autosave(store_id.clone(), db.clone(), changes, control_rx));
        Ok(Self {
            store_id,
            db,
            control,
            task,
        })
    }

    pub fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    /// Resolves once every mutation made before the call is on disk.
    pub async fn flush(&self) {
        self.flush_handle().flush().await
    }

    pub fn flush_handle(&self) -> PersistFlush {
        PersistFlush {
            control: self.control.clone(),
        }
    }

    /// Stop autosaving and release the database. Persisted data stays.
    pub async fn detach(self) {
        self.shutdown().await;
        debug!(store_id = %self.store_id, "persister detached");
    }

    /// Stop autosaving and delete the database file. Irreversible.
    pub async fn purge(self) -> anyhow::Result<()> {
        self.shutdown().await;
        let result = delete_db_files(self.db.db_file()).await;
        match &result {
            Ok(()) => info!(store_id = %self.store_id, "local store data deleted"),
            Err(e) => {
                error!(store_id = %self.store_id, error = %e, "failed to delete local store data")
            }
        }
        result
    }

    /// Delete the database of a store that is not mounted.
    pub async fn purge_files(stores_dir: &Path, store_id: &StoreId) -> anyhow::Result<()> {
        let result = delete_db_files(&Self::db_path(stores_dir, store_id)).await;
        if let Err(e) = &result {
            error!(store_id = %store_id, error = %e, "failed to delete local store data");
        }
        result
    }

    async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = self.db.close().await {
            error!(store_id = %self.store_id, error = %e, "failed to close store database");
        }
    }
}

impl Drop for LocalPersister {
    fn drop(&mut self) {
        // Stop() normally ends the task; this only matters when the persister
        // is dropped without detach.
        self.task.abort();
    }
}

async fn autosave(
    store_id: StoreId,
    db: StoreDb,
    mut changes: mpsc::UnboundedReceiver<Change>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    loop {
        tokio::select! {
            biased;
            Some(change) = changes.recv() => persist(&store_id, &db, change).await,
            Some(command) = control.recv() => {
                while let Ok(change) = changes.try_recv() {
                    persist(&store_id, &db, change).await;
                }
                match command {
                    Control::Flush(done) => {
                        let _ = done.send(());
                    }
                    Control::Stop(done) => {
                        let _ = done.send(());
                        break;
                    }
                }
            }
            else => break,
        }
    }
}

async fn persist(store_id: &StoreId, db: &StoreDb, change: Change) {
    if change.origin == ChangeOrigin::Load {
        return;
    }
    if let Err(e) = db.write_change(&change.kind).await {
        error!(store_id = %store_id, error = %e, "autosave failed");
    }
}
