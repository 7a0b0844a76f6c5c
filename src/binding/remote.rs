use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::core::store::{
    Change, ChangeKind, ChangeOrigin, Store, StoreHandle, StoreId, StoreSnapshot,
};
use crate::error::TransportError;

/// Opens real-time channels to the remote store endpoint.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn connect(
        &self,
        store_id: &StoreId,
    ) -> Result<Box<dyn SyncChannel>, TransportError>;
    /// Out-of-band request to drop everything the remote side holds for a store.
    async fn delete_remote(&self, store_id: &StoreId) -> Result<(), TransportError>;
}

/// One open connection for one store.
#[async_trait]
pub trait SyncChannel: Send {
    /// Fetch the remote side's full content.
    async fn pull(&mut self) -> Result<StoreSnapshot, TransportError>;
    /// Offer the full local content.
    async fn push(&mut self, snapshot: &StoreSnapshot) -> Result<(), TransportError>;
    async fn send_change(&mut self, change: &ChangeKind) -> Result<(), TransportError>;
    /// Next incremental change from the remote side; `None` when the remote
    /// closed the channel.
    async fn next_change(&mut self) -> Result<Option<ChangeKind>, TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Connecting,
    Connected,
    Disconnected,
    Stopped,
}

/// Exponential reconnect delay, doubling from `min` and capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, next: min }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_min_ms),
            Duration::from_millis(config.reconnect_max_ms),
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.min;
    }
}

/// Keeps a store in step with its remote channel until detached.
pub struct RemoteSynchronizer {
    store_id: StoreId,
    transport: Arc<dyn SyncTransport>,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<SyncStatus>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RemoteSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSynchronizer")
            .field("store_id", &self.store_id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

enum SessionEnd {
    Shutdown,
    Dropped(TransportError),
}

impl RemoteSynchronizer {
    pub fn start(
        store: &StoreHandle,
        transport: Arc<dyn SyncTransport>,
        config: &SyncConfig,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (status_tx, status) = watch::channel(SyncStatus::Connecting);
        let changes = store.subscribe();
        let task = tokio::spawn(run(
            store.clone(),
            transport.clone(),
            changes,
            shutdown_rx,
            status_tx,
            Backoff::from_config(config),
        ));
        Self {
            store_id: store.id().clone(),
            transport,
            shutdown,
            status,
            task: Some(task),
        }
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stop syncing and close the channel. Remote data stays.
    pub async fn detach(mut self) {
        self.stop().await;
        debug!(store_id = %self.store_id, "synchronizer detached");
    }

    /// Stop syncing, then ask the remote side to delete the store.
    pub async fn purge(mut self) -> Result<(), TransportError> {
        self.stop().await;
        delete_remote(self.transport.as_ref(), &self.store_id).await
    }

    async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
            && e.is_panic()
        {
            warn!(store_id = %self.store_id, "sync task panicked");
        }
    }
}

impl Drop for RemoteSynchronizer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Request remote deletion; failures are logged and returned, never retried
/// here.
pub async fn delete_remote(
    transport: &dyn SyncTransport,
    store_id: &StoreId,
) -> Result<(), TransportError> {
    match transport.delete_remote(store_id).await {
        Ok(()) => {
            info!(store_id = %store_id, "remote store deleted");
            Ok(())
        }
        Err(e) => {
            warn!(store_id = %store_id, error = %e, "remote store deletion failed");
            Err(e)
        }
    }
}

async fn run(
    store: StoreHandle,
    transport: Arc<dyn SyncTransport>,
    mut changes: mpsc::UnboundedReceiver<Change>,
    mut shutdown: watch::Receiver<bool>,
    status: watch::Sender<SyncStatus>,
    mut backoff: Backoff,
) {
    let store_id = store.id().clone();
    loop {
        if *shutdown.borrow() {
            break;
        }
        status.send_replace(SyncStatus::Connecting);
        let connected = tokio::select! {
            result = transport.connect(&store_id) => result,
            _ = shutdown.changed() => break,
        };
        let end = match connected {
            Ok(mut channel) => {
                let end = session(
                    &store,
                    channel.as_mut(),
                    &mut changes,
                    &mut shutdown,
                    &status,
                    &mut backoff,
                )
                .await;
                if let Err(e) = channel.close().await {
                    debug!(store_id = %store_id, error = %e, "closing sync channel failed");
                }
                end
            }
            Err(e) => SessionEnd::Dropped(e),
        };
        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Dropped(e) => {
                status.send_replace(SyncStatus::Disconnected);
                let delay = backoff.next_delay();
                warn!(
                    store_id = %store_id,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "sync connection lost"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
    status.send_replace(SyncStatus::Stopped);
}

async fn session(
    store: &Store,
    channel: &mut dyn SyncChannel,
    changes: &mut mpsc::UnboundedReceiver<Change>,
    shutdown: &mut watch::Receiver<bool>,
    status: &watch::Sender<SyncStatus>,
    backoff: &mut Backoff,
) -> SessionEnd {
    let reconciled = tokio::select! {
        result = reconcile(store, channel, changes) => result,
        _ = shutdown.changed() => return SessionEnd::Shutdown,
    };
    if let Err(e) = reconciled {
        return SessionEnd::Dropped(e);
    }
    backoff.reset();
    status.send_replace(SyncStatus::Connected);

    loop {
        tokio::select! {
            change = changes.recv() => {
                let Some(change) = change else {
                    return SessionEnd::Shutdown;
                };
                if change.origin != ChangeOrigin::Local
                    || matches!(change.kind, ChangeKind::Loaded)
                {
                    continue;
                }
                if let Err(e) = channel.send_change(&change.kind).await {
                    return SessionEnd::Dropped(e);
                }
            }
            incoming = channel.next_change() => match incoming {
                Ok(Some(kind)) => {
                    store.apply_remote(kind);
                }
                Ok(None) => return SessionEnd::Dropped(TransportError::Closed),
                Err(e) => return SessionEnd::Dropped(e),
            },
            _ = shutdown.changed() => return SessionEnd::Shutdown,
        }
    }
}

/// Pull-then-push. Runs on every (re)connection so that anything missed
/// while disconnected flows both ways, deletions included: local tombstones
/// keep older remote copies out and travel with the pushed snapshot.
async fn reconcile(
    store: &Store,
    channel: &mut dyn SyncChannel,
    changes: &mut mpsc::UnboundedReceiver<Change>,
) -> Result<(), TransportError> {
    let remote = channel.pull().await?;
    let mut applied = 0usize;
    for record in remote.records {
        if store.merge_remote_record(record) {
            applied += 1;
        }
    }
    for tombstone in remote.tombstones {
        if store.merge_remote_tombstone(tombstone) {
            applied += 1;
        }
    }
    for (key, value) in remote.values {
        if store.value(&key).is_none() {
            store.apply_remote(ChangeKind::ValueSet { key, value });
        }
    }

    // Everything queued so far is covered by the full push below.
    while changes.try_recv().is_ok() {}

    let local = store.snapshot();
    channel.push(&local).await?;
    debug!(
        store_id = %store.id(),
        pulled = applied,
        pushed = local.records.len(),
        tombstones = local.tombstones.len(),
        "sync reconciled"
    );
    Ok(())
}
