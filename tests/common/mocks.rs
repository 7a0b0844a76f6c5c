use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sitebook::binding::{SyncChannel, SyncTransport};
use sitebook::core::ProjectInfo;
use sitebook::core::db::ResourceType;
use sitebook::core::store::{ChangeKind, Record, StoreId, StoreSnapshot, Tombstone};
use sitebook::remote::{AccountingClient, MediaClient, UploadRequest, UploadResponse};
use sitebook::TransportError;
use tokio::sync::mpsc;

/// Media endpoint that records every call it receives.
#[derive(Default)]
pub struct MockMediaClient {
    uploads: AtomicUsize,
    deletes: AtomicUsize,
    fetches: AtomicUsize,
    failing: AtomicBool,
    uploaded_items: Mutex<Vec<String>>,
    deleted_ids: Mutex<Vec<String>>,
}

impl MockMediaClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every request that reached the "network".
    pub fn calls(&self) -> usize {
        self.upload_calls() + self.delete_calls() + self.fetches.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn uploaded_items(&self) -> Vec<String> {
        self.uploaded_items.lock().unwrap().clone()
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted_ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaClient for MockMediaClient {
    async fn upload(&self, request: UploadRequest) -> Result<UploadResponse, TransportError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Status(503));
        }
        self.uploaded_items.lock().unwrap().push(request.item_id.clone());
        Ok(UploadResponse {
            id: Some(format!("remote-{}", request.item_id)),
            url: None,
        })
    }

    async fn fetch(
        &self,
        _resource_type: ResourceType,
        _organization_id: &str,
        _project_id: &str,
        _id: &str,
    ) -> Result<Vec<u8>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn delete(
        &self,
        _resource_type: ResourceType,
        _organization_id: &str,
        _project_id: &str,
        ids: &[String],
    ) -> Result<(), TransportError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout(std::time::Duration::from_secs(30)));
        }
        self.deleted_ids.lock().unwrap().extend(ids.iter().cloned());
        Ok(())
    }
}

/// In-memory remote sync endpoint. Holds one snapshot per store id and
/// lets tests inject remote changes or cut connections.
#[derive(Default)]
pub struct MockTransport {
    remote: Arc<Mutex<HashMap<String, StoreSnapshot>>>,
    offline: AtomicBool,
    connects: AtomicUsize,
    deleted: Mutex<Vec<String>>,
    links: Mutex<HashMap<String, mpsc::UnboundedSender<Option<ChangeKind>>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn remote_snapshot(&self, store_id: &str) -> StoreSnapshot {
        self.remote
            .lock()
            .unwrap()
            .get(store_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Change remote content without telling any connected client.
    pub fn put_remote_record(&self, store_id: &str, record: Record) {
        let mut remote = self.remote.lock().unwrap();
        apply(remote.entry(store_id.to_string()).or_default(), ChangeKind::RowSet { record });
    }

    /// Deliver a change to the connected client, as if another device made it.
    pub fn inject_change(&self, store_id: &str, change: ChangeKind) -> bool {
        {
            let mut remote = self.remote.lock().unwrap();
            apply(remote.entry(store_id.to_string()).or_default(), change.clone());
        }
        match self.links.lock().unwrap().get(store_id) {
            Some(link) => link.send(Some(change)).is_ok(),
            None => false,
        }
    }

    /// Make the open channel fail as a dropped connection would.
    pub fn drop_connection(&self, store_id: &str) {
        if let Some(link) = self.links.lock().unwrap().remove(store_id) {
            let _ = link.send(None);
        }
    }
}

/// Newer-wins merge on the server side, tombstones included.
fn apply(snapshot: &mut StoreSnapshot, change: ChangeKind) {
    match change {
        ChangeKind::RowSet { record } => {
            let buried = snapshot
                .tombstones
                .iter()
                .position(|t| t.id == record.id && t.table == record.table());
            if let Some(index) = buried {
                if snapshot.tombstones[index].deleted_at_ms >= record.updated_at_ms {
                    return;
                }
                snapshot.tombstones.remove(index);
            }
            match snapshot
                .records
                .iter_mut()
                .find(|r| r.id == record.id && r.table() == record.table())
            {
                Some(existing) => {
                    if existing.updated_at_ms < record.updated_at_ms {
                        *existing = record;
                    }
                }
                None => snapshot.records.push(record),
            }
        }
        ChangeKind::RowDeleted {
            table,
            id,
            deleted_at_ms,
        } => {
            let newer_row = snapshot
                .records
                .iter()
                .any(|r| r.id == id && r.table() == table && r.updated_at_ms > deleted_at_ms);
            if newer_row {
                return;
            }
            let deleted_at_ms = snapshot
                .tombstones
                .iter()
                .filter(|t| t.id == id && t.table == table)
                .map(|t| t.deleted_at_ms)
                .fold(deleted_at_ms, i64::max);
            snapshot.records.retain(|r| !(r.id == id && r.table() == table));
            snapshot.tombstones.retain(|t| !(t.id == id && t.table == table));
            snapshot.tombstones.push(Tombstone {
                table,
                id,
                deleted_at_ms,
            });
        }
        ChangeKind::ValueSet { key, value } => {
            snapshot.values.insert(key, value);
        }
        ChangeKind::Loaded => {}
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn connect(&self, store_id: &StoreId) -> Result<Box<dyn SyncChannel>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("offline".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.links
            .lock()
            .unwrap()
            .insert(store_id.to_string(), tx);
        Ok(Box::new(MockChannel {
            store_id: store_id.to_string(),
            remote: self.remote.clone(),
            incoming: rx,
        }))
    }

    async fn delete_remote(&self, store_id: &StoreId) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("offline".into()));
        }
        self.deleted.lock().unwrap().push(store_id.to_string());
        self.remote.lock().unwrap().remove(store_id.as_str());
        Ok(())
    }
}

struct MockChannel {
    store_id: String,
    remote: Arc<Mutex<HashMap<String, StoreSnapshot>>>,
    incoming: mpsc::UnboundedReceiver<Option<ChangeKind>>,
}

#[async_trait]
impl SyncChannel for MockChannel {
    async fn pull(&mut self) -> Result<StoreSnapshot, TransportError> {
        Ok(self
            .remote
            .lock()
            .unwrap()
            .get(&self.store_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn push(&mut self, snapshot: &StoreSnapshot) -> Result<(), TransportError> {
        let mut remote = self.remote.lock().unwrap();
        let target = remote.entry(self.store_id.clone()).or_default();
        for record in &snapshot.records {
            apply(target, ChangeKind::RowSet { record: record.clone() });
        }
        for tombstone in &snapshot.tombstones {
            apply(
                target,
                ChangeKind::RowDeleted {
                    table: tombstone.table,
                    id: tombstone.id.clone(),
                    deleted_at_ms: tombstone.deleted_at_ms,
                },
            );
        }
        for (key, value) in &snapshot.values {
            target.values.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn send_change(&mut self, change: &ChangeKind) -> Result<(), TransportError> {
        let mut remote = self.remote.lock().unwrap();
        apply(remote.entry(self.store_id.clone()).or_default(), change.clone());
        Ok(())
    }

    async fn next_change(&mut self) -> Result<Option<ChangeKind>, TransportError> {
        match self.incoming.recv().await {
            Some(Some(change)) => Ok(Some(change)),
            Some(None) => Err(TransportError::Closed),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Accounting system that remembers what it was asked.
#[derive(Default)]
pub struct MockAccounting {
    known: Mutex<HashSet<String>>,
    exists_calls: AtomicUsize,
    creates: AtomicUsize,
    updated_names: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl MockAccounting {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn exists_calls(&self) -> usize {
        self.exists_calls.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updated_names(&self) -> Vec<String> {
        self.updated_names.lock().unwrap().clone()
    }
}

#[async_trait]
impl AccountingClient for MockAccounting {
    async fn exists(&self, project: &ProjectInfo) -> Result<bool, TransportError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        let known = self.known.lock().unwrap();
        Ok(project
            .accounting_id
            .as_ref()
            .is_some_and(|id| known.contains(id)))
    }

    async fn create(&self, project: &ProjectInfo) -> Result<String, TransportError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Status(500));
        }
        let id = format!("acct-{}", project.id);
        self.known.lock().unwrap().insert(id.clone());
        Ok(id)
    }

    async fn update(&self, project: &ProjectInfo) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Status(500));
        }
        self.updated_names.lock().unwrap().push(project.name.clone());
        Ok(())
    }
}
