//! In-memory project store.
//!
//! A store is a fixed set of typed tables plus scalar values. Mutations are
//! applied in memory, then handed to synchronous listeners (same call), then
//! queued to async subscribers such as the local persister and the remote
//! synchronizer.

mod table;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::OpResult;

pub use table::{
    Cents, ChangeOrder, ChangeOrderItem, ChangeOrderStatus, Invoice, MediaEntry, MediaType, Note,
    Receipt, Row, TableKind, WorkItemCostEntry, WorkItemSummary,
};

/// Identifies one store on disk and on the sync endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreId(String);

impl StoreId {
    /// Store owned by a single project: `<prefix>-<entity>`.
    pub fn per_entity(prefix: &str, entity_id: &str) -> Self {
        Self(format!("{}-{}", prefix, entity_id))
    }

    /// Store shared by everything an owner can see: `<prefix>_<owner>`.
    pub fn shared(prefix: &str, owner_id: &str) -> Self {
        Self(format!("{}_{}", prefix, owner_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name safe to use as a file stem.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub row: Row,
    pub updated_at_ms: i64,
}

impl Record {
    pub fn table(&self) -> TableKind {
        self.row.table()
    }
}

/// Marker left by a deleted row so that an older copy arriving from the
/// remote side does not bring it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub table: TableKind,
    pub id: String,
    pub deleted_at_ms: i64,
}

/// Serializable image of a whole store; used for seeding, persistence loads
/// and remote reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub tombstones: Vec<Tombstone>,
}

impl StoreSnapshot {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.values.is_empty() && self.tombstones.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOrigin {
    Local,
    Remote,
    Load,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChangeKind {
    RowSet { record: Record },
    RowDeleted {
        table: TableKind,
        id: String,
        /// Zero when the sender did not say; treated as "now" on receipt.
        #[serde(default)]
        deleted_at_ms: i64,
    },
    ValueSet { key: String, value: serde_json::Value },
    /// Bulk load from disk; listeners should recompute everything.
    Loaded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub origin: ChangeOrigin,
}

impl Change {
    pub fn touches(&self, table: TableKind) -> bool {
        match &self.kind {
            ChangeKind::RowSet { record } => record.table() == table,
            ChangeKind::RowDeleted { table: t, .. } => *t == table,
            ChangeKind::ValueSet { .. } => false,
            ChangeKind::Loaded => true,
        }
    }
}

pub type ListenerId = u64;
type Listener = Arc<dyn Fn(&Store, &Change) + Send + Sync>;

#[derive(Default)]
struct Contents {
    tables: BTreeMap<TableKind, BTreeMap<String, Record>>,
    values: BTreeMap<String, serde_json::Value>,
    tombstones: BTreeMap<(TableKind, String), i64>,
}

pub type StoreHandle = Arc<Store>;

pub struct Store {
    id: StoreId,
    contents: Mutex<Contents>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Change>>>,
    next_listener: AtomicU64,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("id", &self.id).finish()
    }
}

pub fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking listener must not wedge the store for everyone else.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Store {
    pub fn new(id: StoreId) -> StoreHandle {
        Arc::new(Self {
            id,
            contents: Mutex::new(Contents::default()),
            listeners: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> &StoreId {
        &self.id
    }

    pub fn rows(&self, table: TableKind) -> Vec<Record> {
        lock(&self.contents)
            .tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: TableKind, id: &str) -> Option<Record> {
        lock(&self.contents)
            .tables
            .get(&table)
            .and_then(|rows| rows.get(id).cloned())
    }

    pub fn row_count(&self, table: TableKind) -> usize {
        lock(&self.contents)
            .tables
            .get(&table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    pub fn value(&self, key: &str) -> Option<serde_json::Value> {
        lock(&self.contents).values.get(key).cloned()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let contents = lock(&self.contents);
        StoreSnapshot {
            records: contents
                .tables
                .values()
                .flat_map(|rows| rows.values().cloned())
                .collect(),
            values: contents.values.clone(),
            tombstones: contents
                .tombstones
                .iter()
                .map(|((table, id), deleted_at_ms)| Tombstone {
                    table: *table,
                    id: id.clone(),
                    deleted_at_ms: *deleted_at_ms,
                })
                .collect(),
        }
    }

    /// When the row was deleted, if it was.
    pub fn deleted_at(&self, table: TableKind, id: &str) -> Option<i64> {
        lock(&self.contents)
            .tombstones
            .get(&(table, id.to_string()))
            .copied()
    }

    /// Insert a row under a freshly generated id.
    pub fn insert_row(&self, row: Row) -> OpResult {
        let id = Uuid::new_v4().to_string();
        self.write_row(id.clone(), row, ChangeOrigin::Local);
        OpResult::success(id)
    }

    /// Insert or overwrite the row with the given id.
    pub fn upsert_row(&self, id: impl Into<String>, row: Row) -> OpResult {
        let id = id.into();
        self.write_row(id.clone(), row, ChangeOrigin::Local);
        OpResult::success(id)
    }

    /// Overwrite an existing row. Missing rows are reported, not created.
    pub fn update_row(&self, id: &str, row: Row) -> OpResult {
        if self.row(row.table(), id).is_none() {
            return OpResult::not_found(id, format!("no {} row {}", row.table().as_str(), id));
        }
        self.write_row(id.to_string(), row, ChangeOrigin::Local);
        OpResult::success(id)
    }

    /// Delete a row and leave a tombstone in its place.
    pub fn delete_row(&self, table: TableKind, id: &str) -> OpResult {
        let deleted_at_ms = {
            let mut contents = lock(&self.contents);
            let Some(previous) = contents
                .tables
                .get_mut(&table)
                .and_then(|rows| rows.remove(id))
            else {
                return OpResult::not_found(id, format!("no {} row {}", table.as_str(), id));
            };
            let deleted_at_ms = now_ms().max(previous.updated_at_ms + 1);
            contents
                .tombstones
                .insert((table, id.to_string()), deleted_at_ms);
            deleted_at_ms
        };
        self.emit(Change {
            kind: ChangeKind::RowDeleted {
                table,
                id: id.to_string(),
                deleted_at_ms,
            },
            origin: ChangeOrigin::Local,
        });
        OpResult::success(id)
    }

    /// Set a scalar value. Writing an identical value is a no-op.
    pub fn set_value(&self, key: &str, value: serde_json::Value) {
        {
            let mut contents = lock(&self.contents);
            if contents.values.get(key) == Some(&value) {
                return;
            }
            contents.values.insert(key.to_string(), value.clone());
        }
        self.emit(Change {
            kind: ChangeKind::ValueSet {
                key: key.to_string(),
                value,
            },
            origin: ChangeOrigin::Local,
        });
    }

    /// Replace contents with a snapshot read from disk.
    pub fn load(&self, snapshot: StoreSnapshot) {
        {
            let mut contents = lock(&self.contents);
            *contents = Contents::default();
            for record in snapshot.records {
                contents
                    .tables
                    .entry(record.table())
                    .or_default()
                    .insert(record.id.clone(), record);
            }
            contents.values = snapshot.values;
            for tombstone in snapshot.tombstones {
                contents
                    .tombstones
                    .insert((tombstone.table, tombstone.id), tombstone.deleted_at_ms);
            }
        }
        self.emit(Change {
            kind: ChangeKind::Loaded,
            origin: ChangeOrigin::Load,
        });
    }

    /// Apply a record received from the remote side. Copies older than what
    /// is held locally, or than a local deletion, are ignored. Returns
    /// whether anything changed.
    pub fn merge_remote_record(&self, record: Record) -> bool {
        {
            let mut contents = lock(&self.contents);
            let key = (record.table(), record.id.clone());
            if contents
                .tombstones
                .get(&key)
                .is_some_and(|deleted_at_ms| *deleted_at_ms >= record.updated_at_ms)
            {
                return false;
            }
            let rows = contents.tables.entry(record.table()).or_default();
            if let Some(local) = rows.get(&record.id)
                && (local.updated_at_ms >= record.updated_at_ms || *local == record)
            {
                return false;
            }
            rows.insert(record.id.clone(), record.clone());
            contents.tombstones.remove(&key);
        }
        self.emit(Change {
            kind: ChangeKind::RowSet { record },
            origin: ChangeOrigin::Remote,
        });
        true
    }

    /// Apply a deletion received from the remote side. A local copy written
    /// after the deletion survives it. Returns whether anything changed.
    pub fn merge_remote_tombstone(&self, tombstone: Tombstone) -> bool {
        let Tombstone {
            table,
            id,
            deleted_at_ms,
        } = tombstone;
        {
            let mut contents = lock(&self.contents);
            let key = (table, id.clone());
            if contents
                .tombstones
                .get(&key)
                .is_some_and(|known| *known >= deleted_at_ms)
            {
                return false;
            }
            if let Some(rows) = contents.tables.get_mut(&table) {
                if rows
                    .get(&id)
                    .is_some_and(|local| local.updated_at_ms > deleted_at_ms)
                {
                    return false;
                }
                rows.remove(&id);
            }
            contents.tombstones.insert(key, deleted_at_ms);
        }
        self.emit(Change {
            kind: ChangeKind::RowDeleted {
                table,
                id,
                deleted_at_ms,
            },
            origin: ChangeOrigin::Remote,
        });
        true
    }

    /// Apply an incremental change received from the remote side.
    pub fn apply_remote(&self, change: ChangeKind) -> bool {
        match change {
            ChangeKind::RowSet { record } => self.merge_remote_record(record),
            ChangeKind::RowDeleted {
                table,
                id,
                deleted_at_ms,
            } => {
                let deleted_at_ms = if deleted_at_ms > 0 {
                    deleted_at_ms
                } else {
                    now_ms()
                };
                self.merge_remote_tombstone(Tombstone {
                    table,
                    id,
                    deleted_at_ms,
                })
            }
            ChangeKind::ValueSet { key, value } => {
                {
                    let mut contents = lock(&self.contents);
                    if contents.values.get(&key) == Some(&value) {
                        return false;
                    }
                    contents.values.insert(key.clone(), value.clone());
                }
                self.emit(Change {
                    kind: ChangeKind::ValueSet { key, value },
                    origin: ChangeOrigin::Remote,
                });
                true
            }
            ChangeKind::Loaded => false,
        }
    }

    /// Register a synchronous listener. It runs after every mutation, inside
    /// the mutating call, and may itself mutate the store.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Store, &Change) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        lock(&self.listeners).retain(|(listener_id, _)| *listener_id != id);
    }

    /// Receive every future change in mutation order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Change> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    fn write_row(&self, id: String, row: Row, origin: ChangeOrigin) {
        let record = {
            let mut contents = lock(&self.contents);
            let buried = contents.tombstones.remove(&(row.table(), id.clone()));
            let rows = contents.tables.entry(row.table()).or_default();
            // Keep timestamps strictly increasing per row, across deletes too,
            // so remote merges never prefer a stale copy written in the same
            // millisecond.
            let updated_at_ms = match rows.get(&id).map(|prev| prev.updated_at_ms).or(buried) {
                Some(prev) => now_ms().max(prev + 1),
                None => now_ms(),
            };
            let record = Record {
                id: id.clone(),
                row,
                updated_at_ms,
            };
            rows.insert(id, record.clone());
            record
        };
        self.emit(Change {
            kind: ChangeKind::RowSet { record },
            origin,
        });
    }

    fn emit(&self, change: Change) {
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(self, &change);
        }
        lock(&self.subscribers).retain(|tx| tx.send(change.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(body: &str) -> Row {
        Row::Notes(Note {
            body: body.to_string(),
            created_at: None,
        })
    }

    #[test]
    fn store_ids_follow_naming_scheme() {
        assert_eq!(StoreId::per_entity("project", "p1").as_str(), "project-p1");
        assert_eq!(StoreId::shared("projects", "org9").as_str(), "projects_org9");
        assert_eq!(StoreId::per_entity("project", "a/b").file_stem(), "project-a_b");
    }

    #[test]
    fn update_and_delete_of_missing_rows_report_not_found() {
        let store = Store::new(StoreId::per_entity("project", "p1"));
        let result = store.update_row("nope", note("x"));
        assert_eq!(result.status, crate::error::OpStatus::NotFound);
        let result = store.delete_row(TableKind::Notes, "nope");
        assert_eq!(result.status, crate::error::OpStatus::NotFound);
    }

    #[test]
    fn subscribers_see_changes_in_order() {
        let store = Store::new(StoreId::per_entity("project", "p1"));
        let mut rx = store.subscribe();
        let id = store.insert_row(note("first")).id;
        store.delete_row(TableKind::Notes, &id);

        let first = rx.try_recv().unwrap();
        assert!(matches!(first.kind, ChangeKind::RowSet { .. }));
        let second = rx.try_recv().unwrap();
        assert!(matches!(second.kind, ChangeKind::RowDeleted { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stale_remote_records_are_ignored() {
        let store = Store::new(StoreId::per_entity("project", "p1"));
        store.upsert_row("n1", note("local"));
        let local = store.row(TableKind::Notes, "n1").unwrap();

        let stale = Record {
            id: "n1".into(),
            row: note("remote"),
            updated_at_ms: local.updated_at_ms - 1,
        };
        assert!(!store.merge_remote_record(stale));

        let fresh = Record {
            id: "n1".into(),
            row: note("remote"),
            updated_at_ms: local.updated_at_ms + 10,
        };
        assert!(store.merge_remote_record(fresh));
        assert_eq!(
            store.row(TableKind::Notes, "n1").unwrap().row,
            note("remote")
        );
    }

    #[test]
    fn deleted_rows_resist_older_remote_copies() {
        let store = Store::new(StoreId::per_entity("project", "p1"));
        store.upsert_row("n1", note("local"));
        let before = store.row(TableKind::Notes, "n1").unwrap();
        store.delete_row(TableKind::Notes, "n1");
        let deleted_at = store.deleted_at(TableKind::Notes, "n1").unwrap();
        assert!(deleted_at > before.updated_at_ms);

        // The copy the remote side still holds is older than the delete
        assert!(!store.merge_remote_record(before.clone()));
        assert!(store.row(TableKind::Notes, "n1").is_none());
        assert_eq!(store.snapshot().tombstones.len(), 1);

        // An edit made elsewhere after the delete wins
        let later = Record {
            updated_at_ms: deleted_at + 1,
            ..before
        };
        assert!(store.merge_remote_record(later));
        assert!(store.row(TableKind::Notes, "n1").is_some());
        assert!(store.deleted_at(TableKind::Notes, "n1").is_none());
    }

    #[test]
    fn remote_deletes_lose_to_newer_local_edits() {
        let store = Store::new(StoreId::per_entity("project", "p1"));
        store.upsert_row("n1", note("local"));
        let local = store.row(TableKind::Notes, "n1").unwrap();

        let stale = Tombstone {
            table: TableKind::Notes,
            id: "n1".into(),
            deleted_at_ms: local.updated_at_ms - 1,
        };
        assert!(!store.merge_remote_tombstone(stale));
        assert!(store.row(TableKind::Notes, "n1").is_some());

        let fresh = Tombstone {
            table: TableKind::Notes,
            id: "n1".into(),
            deleted_at_ms: local.updated_at_ms + 1,
        };
        assert!(store.merge_remote_tombstone(fresh));
        assert!(store.row(TableKind::Notes, "n1").is_none());

        // Writing the row again clears the tombstone
        store.upsert_row("n1", note("back"));
        assert!(store.deleted_at(TableKind::Notes, "n1").is_none());
        assert!(store.row(TableKind::Notes, "n1").unwrap().updated_at_ms > local.updated_at_ms + 1);
    }

    #[test]
    fn listeners_run_inside_the_mutation() {
        let store = Store::new(StoreId::per_entity("project", "p1"));
        store.add_listener(|store, change| {
            if change.touches(TableKind::Notes) {
                store.set_value("noteCount", store.row_count(TableKind::Notes).into());
            }
        });
        store.insert_row(note("a"));
        store.insert_row(note("b"));
        assert_eq!(store.value("noteCount"), Some(serde_json::json!(2)));
    }
}
