mod model;
mod receipt;
mod server_delete;
mod state;
mod upload;

use std::collections::BTreeSet;
use std::{path::Path, sync::Arc};

use anyhow::Context;
use sqlx::{Connection, Row as _};
use tracing::warn;

use crate::core::store::{ChangeKind, Record, Row, StoreSnapshot, TableKind, Tombstone};
use model::{decode_media_type, decode_timestamp, format_timestamp, lenient_string_list};
use state::{DbState, QUEUE_MIGRATOR, STORE_MIGRATOR};

pub use model::ResourceType;
pub use receipt::{NewReceiptQueueEntry, ReceiptLineItem, ReceiptQueueEntry, ReceiptQueueRepository};
pub use server_delete::{ServerDeleteRecord, ServerDeleteRepository};
pub use upload::{UploadQueueEntry, UploadQueueRepository};

pub(crate) use state::delete_db_files;

const UPSERT_RECORD: &str = r#"INSERT INTO records (tbl, row_id, body, updated_at)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (tbl, row_id) DO UPDATE SET
        body = EXCLUDED.body,
        updated_at = EXCLUDED.updated_at"#;

const UPSERT_TOMBSTONE: &str = r#"INSERT INTO tombstones (tbl, row_id, deleted_at)
    VALUES ($1, $2, $3)
    ON CONFLICT (tbl, row_id) DO UPDATE SET deleted_at = EXCLUDED.deleted_at"#;

/// The on-device database behind one project store.
#[derive(Debug, Clone)]
pub struct StoreDb {
    state: Arc<DbState>,
}

impl StoreDb {
    pub async fn open<P: AsRef<Path>>(db_file: P) -> anyhow::Result<Self> {
        Ok(Self {
            state: Arc::new(DbState::open(db_file.as_ref(), &STORE_MIGRATOR).await?),
        })
    }

    pub fn db_file(&self) -> &Path {
        self.state.db_file()
    }

    /// Read everything persisted for this store. Rows that no longer decode
    /// are skipped with a warning.
    pub async fn load_snapshot(&self) -> anyhow::Result<StoreSnapshot> {
        let mut conn = self.state.conn().await?;
        let rows =
            sqlx::query("SELECT tbl, row_id, body, updated_at FROM records ORDER BY tbl, row_id")
                .fetch_all(&mut **conn)
                .await?;
        let mut snapshot = StoreSnapshot::default();
        for record in rows {
            let tbl: String = record.try_get("tbl")?;
            let row_id: String = record.try_get("row_id")?;
            let body: String = record.try_get("body")?;
            match serde_json::from_str::<Row>(&body) {
                Ok(row) if row.table().as_str() == tbl => snapshot.records.push(Record {
                    id: row_id,
                    row,
                    updated_at_ms: record.try_get("updated_at")?,
                }),
                Ok(_) => warn!(
                    tbl,
                    row_id,
                    "persisted row stored under the wrong table, skipping"
                ),
                Err(e) => warn!(tbl, row_id, error = %e, "undecodable persisted row, skipping"),
            }
        }
        let values = sqlx::query("SELECT key, value FROM store_values")
            .fetch_all(&mut **conn)
            .await?;
        for value in values {
            let key: String = value.try_get("key")?;
            let raw: String = value.try_get("value")?;
            match serde_json::from_str(&raw) {
                Ok(parsed) => {
                    snapshot.values.insert(key, parsed);
                }
                Err(e) => warn!(key, error = %e, "undecodable persisted value, skipping"),
            }
        }
        let tombstones = sqlx::query("SELECT tbl, row_id, deleted_at FROM tombstones")
            .fetch_all(&mut **conn)
            .await?;
        for tombstone in tombstones {
            let tbl: String = tombstone.try_get("tbl")?;
            match TableKind::try_from(tbl.as_str()) {
                Ok(table) => snapshot.tombstones.push(Tombstone {
                    table,
                    id: tombstone.try_get("row_id")?,
                    deleted_at_ms: tombstone.try_get("deleted_at")?,
                }),
                Err(_) => warn!(tbl, "tombstone for an unknown table, skipping"),
            }
        }
        Ok(snapshot)
    }

    /// Persist a whole snapshot in one transaction.
    pub async fn write_snapshot(&self, snapshot: &StoreSnapshot) -> anyhow::Result<()> {
        let mut conn = self.state.conn().await?;
        let mut tx = conn.begin().await?;
        for record in &snapshot.records {
            sqlx::query(UPSERT_RECORD)
                .bind(record.table().as_str())
                .bind(&record.id)
                .bind(serde_json::to_string(&record.row)?)
                .bind(record.updated_at_ms)
                .execute(&mut *tx)
                .await?;
        }
        for tombstone in &snapshot.tombstones {
            sqlx::query(UPSERT_TOMBSTONE)
                .bind(tombstone.table.as_str())
                .bind(&tombstone.id)
                .bind(tombstone.deleted_at_ms)
                .execute(&mut *tx)
                .await?;
        }
        for (key, value) in &snapshot.values {
            sqlx::query(
                r#"INSERT INTO store_values (key, value) VALUES ($1, $2)
                ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value"#,
            )
            .bind(key)
            .bind(serde_json::to_string(value)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Persist a single store mutation. A row and its tombstone are never
    /// both on disk.
    pub async fn write_change(&self, change: &ChangeKind) -> anyhow::Result<()> {
        let mut conn = self.state.conn().await?;
        match change {
            ChangeKind::RowSet { record } => {
                let mut tx = conn.begin().await?;
                sqlx::query(UPSERT_RECORD)
                    .bind(record.table().as_str())
                    .bind(&record.id)
                    .bind(serde_json::to_string(&record.row)?)
                    .bind(record.updated_at_ms)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(r#"DELETE FROM tombstones WHERE tbl = $1 AND row_id = $2"#)
                    .bind(record.table().as_str())
                    .bind(&record.id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
            }
            ChangeKind::RowDeleted {
                table,
                id,
                deleted_at_ms,
            } => {
                let mut tx = conn.begin().await?;
                sqlx::query(r#"DELETE FROM records WHERE tbl = $1 AND row_id = $2"#)
                    .bind(table.as_str())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(UPSERT_TOMBSTONE)
                    .bind(table.as_str())
                    .bind(id)
                    .bind(*deleted_at_ms)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
            }
            ChangeKind::ValueSet { key, value } => {
                sqlx::query(
                    r#"INSERT INTO store_values (key, value) VALUES ($1, $2)
                    ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value"#,
                )
                .bind(key)
                .bind(serde_json::to_string(value)?)
                .execute(&mut **conn)
                .await?;
            }
            ChangeKind::Loaded => {}
        }
        Ok(())
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.state.close().await
    }
}

/// The shared on-device database holding every recovery queue.
#[derive(Debug, Clone)]
pub struct QueueDb {
    state: Arc<DbState>,
}

impl QueueDb {
    pub async fn open<P: AsRef<Path>>(db_file: P) -> anyhow::Result<Self> {
        Ok(Self {
            state: Arc::new(DbState::open(db_file.as_ref(), &QUEUE_MIGRATOR).await?),
        })
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.state.close().await
    }
}

impl UploadQueueRepository for QueueDb {
    async fn enqueue_upload(&self, entry: &UploadQueueEntry) -> anyhow::Result<()> {
        let mut conn = self.state.conn().await?;
        sqlx::query(
            r#"INSERT INTO upload_queue
            (id, media_type, resource_type, organization_id, project_id, item_id, local_uri,
                upload_date, seq)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM upload_queue))
            ON CONFLICT (id) DO UPDATE SET
                media_type = EXCLUDED.media_type,
                resource_type = EXCLUDED.resource_type,
                organization_id = EXCLUDED.organization_id,
                project_id = EXCLUDED.project_id,
                item_id = EXCLUDED.item_id,
                local_uri = EXCLUDED.local_uri,
                upload_date = EXCLUDED.upload_date,
                revision = upload_queue.revision + 1"#,
        )
        .bind(&entry.id)
        .bind(entry.media_type.as_str())
        .bind(entry.resource_type.as_str())
        .bind(&entry.organization_id)
        .bind(&entry.project_id)
        .bind(&entry.item_id)
        .bind(&entry.local_uri)
        .bind(format_timestamp(entry.upload_date)?)
        .execute(&mut **conn)
        .await
        .with_context(|| format!("Failed to queue upload {}", entry.id))?;
        Ok(())
    }

    async fn get_uploads(&self) -> anyhow::Result<Vec<UploadQueueEntry>> {
        let mut conn = self.state.conn().await?;
        sqlx::query(
            r#"SELECT id, media_type, resource_type, organization_id, project_id, item_id,
                local_uri, upload_date, revision
            FROM upload_queue ORDER BY seq ASC"#,
        )
        .fetch_all(&mut **conn)
        .await?
        .iter()
        .map(upload_from_row)
        .collect()
    }

    async fn get_upload_by_id(&self, id: &str) -> anyhow::Result<Option<UploadQueueEntry>> {
        let mut conn = self.state.conn().await?;
        sqlx::query(
            r#"SELECT id, media_type, resource_type, organization_id, project_id, item_id,
                local_uri, upload_date, revision
            FROM upload_queue WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&mut **conn)
        .await?
        .as_ref()
        .map(upload_from_row)
        .transpose()
    }

    async fn remove_upload(&self, id: &str, revision: i64) -> anyhow::Result<bool> {
        let mut conn = self.state.conn().await?;
        let result = sqlx::query(r#"DELETE FROM upload_queue WHERE id = $1 AND revision = $2"#)
            .bind(id)
            .bind(revision)
            .execute(&mut **conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn upload_from_row(record: &sqlx::sqlite::SqliteRow) -> anyhow::Result<UploadQueueEntry> {
    let media_type: String = record.try_get("media_type")?;
    let resource_type: String = record.try_get("resource_type")?;
    let upload_date: String = record.try_get("upload_date")?;
    Ok(UploadQueueEntry {
        id: record.try_get("id")?,
        media_type: decode_media_type(&media_type),
        resource_type: ResourceType::decode(&resource_type),
        organization_id: record.try_get("organization_id")?,
        project_id: record.try_get("project_id")?,
        item_id: record.try_get("item_id")?,
        local_uri: record.try_get("local_uri")?,
        upload_date: decode_timestamp(&upload_date),
        revision: record.try_get("revision")?,
    })
}

const RECEIPT_COLUMNS: &str = "id, purchase_id, from_project_id, vendor_ref, image_id, \
    line_items, remaining_targets, retired_targets, created_at, revision";

impl ReceiptQueueRepository for QueueDb {
    async fn enqueue_receipt(
        &self,
        entry: &NewReceiptQueueEntry,
    ) -> anyhow::Result<ReceiptQueueEntry> {
        let created_at = time::OffsetDateTime::now_utc();
        let mut conn = self.state.conn().await?;
        let mut tx = conn.begin().await?;

        let select = format!("SELECT {} FROM receipt_queue WHERE id = $1", RECEIPT_COLUMNS);
        let previous = sqlx::query(&select)
            .bind(&entry.purchase_id)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(receipt_from_row)
            .transpose()?;
        let targets = entry.target_project_ids();
        let retired: BTreeSet<String> = match &previous {
            Some(previous) => {
                let pending = previous.pending_targets();
                previous
                    .target_project_ids()
                    .into_iter()
                    .chain(
                        previous
                            .retired_targets
                            .iter()
                            .filter(|target| pending.contains(target))
                            .cloned(),
                    )
                    .filter(|target| !targets.contains(target))
                    .collect()
            }
            None => BTreeSet::new(),
        };

        sqlx::query(
            r#"INSERT INTO receipt_queue
            (id, purchase_id, from_project_id, vendor_ref, image_id, line_items,
                remaining_targets, retired_targets, created_at, seq)
            VALUES ($1, $1, $2, $3, $4, $5, NULL, $6, $7,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM receipt_queue))
            ON CONFLICT (id) DO UPDATE SET
                from_project_id = EXCLUDED.from_project_id,
                vendor_ref = EXCLUDED.vendor_ref,
                image_id = EXCLUDED.image_id,
                line_items = EXCLUDED.line_items,
                remaining_targets = NULL,
                retired_targets = EXCLUDED.retired_targets,
                revision = receipt_queue.revision + 1"#,
        )
        .bind(&entry.purchase_id)
        .bind(&entry.from_project_id)
        .bind(&entry.vendor_ref)
        .bind(&entry.image_id)
        .bind(serde_json::to_string(&entry.line_items)?)
        .bind(serde_json::to_string(&retired)?)
        .bind(format_timestamp(created_at)?)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to queue receipt {}", entry.purchase_id))?;

        let stored = sqlx::query(&select)
            .bind(&entry.purchase_id)
            .fetch_one(&mut *tx)
            .await?;
        let stored = receipt_from_row(&stored)?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn get_receipts(&self) -> anyhow::Result<Vec<ReceiptQueueEntry>> {
        let mut conn = self.state.conn().await?;
        sqlx::query(&format!(
            "SELECT {} FROM receipt_queue ORDER BY seq ASC",
            RECEIPT_COLUMNS
        ))
        .fetch_all(&mut **conn)
        .await?
        .iter()
        .map(receipt_from_row)
        .collect()
    }

    async fn get_receipt_by_id(&self, id: &str) -> anyhow::Result<Option<ReceiptQueueEntry>> {
        let mut conn = self.state.conn().await?;
        sqlx::query(&format!("SELECT {} FROM receipt_queue WHERE id = $1", RECEIPT_COLUMNS))
            .bind(id)
            .fetch_optional(&mut **conn)
            .await?
            .as_ref()
            .map(receipt_from_row)
            .transpose()
    }

    async fn set_remaining_targets(
        &self,
        id: &str,
        revision: i64,
        remaining: &[String],
    ) -> anyhow::Result<bool> {
        let mut conn = self.state.conn().await?;
        let result = sqlx::query(
            r#"UPDATE receipt_queue SET remaining_targets = $1 WHERE id = $2 AND revision = $3"#,
        )
        .bind(serde_json::to_string(remaining)?)
        .bind(id)
        .bind(revision)
        .execute(&mut **conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_receipt(&self, id: &str, revision: i64) -> anyhow::Result<bool> {
        let mut conn = self.state.conn().await?;
        let result = sqlx::query(r#"DELETE FROM receipt_queue WHERE id = $1 AND revision = $2"#)
            .bind(id)
            .bind(revision)
            .execute(&mut **conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn receipt_from_row(record: &sqlx::sqlite::SqliteRow) -> anyhow::Result<ReceiptQueueEntry> {
    let line_items: String = record.try_get("line_items")?;
    let remaining: Option<String> = record.try_get("remaining_targets")?;
    let retired: Option<String> = record.try_get("retired_targets")?;
    let created_at: String = record.try_get("created_at")?;
    Ok(ReceiptQueueEntry {
        id: record.try_get("id")?,
        purchase_id: record.try_get("purchase_id")?,
        from_project_id: record.try_get("from_project_id")?,
        vendor_ref: record.try_get("vendor_ref")?,
        image_id: record.try_get("image_id")?,
        line_items: receipt::decode_line_items(&line_items),
        remaining_targets: remaining.as_deref().map(lenient_string_list),
        retired_targets: retired.as_deref().map(lenient_string_list).unwrap_or_default(),
        created_at: decode_timestamp(&created_at),
        revision: record.try_get("revision")?,
    })
}

impl ServerDeleteRepository for QueueDb {
    async fn enqueue_server_delete(&self, record: &ServerDeleteRecord) -> anyhow::Result<()> {
        let mut conn = self.state.conn().await?;
        sqlx::query(
            r#"INSERT INTO server_delete_queue
            (id, organization_id, project_id, image_ids, image_type, delete_date, seq)
            VALUES ($1, $2, $3, $4, $5, $6,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM server_delete_queue))
            ON CONFLICT (id) DO UPDATE SET
                organization_id = EXCLUDED.organization_id,
                project_id = EXCLUDED.project_id,
                image_ids = EXCLUDED.image_ids,
                image_type = EXCLUDED.image_type,
                delete_date = EXCLUDED.delete_date,
                revision = server_delete_queue.revision + 1"#,
        )
        .bind(&record.id)
        .bind(&record.organization_id)
        .bind(&record.project_id)
        .bind(serde_json::to_string(&record.image_ids)?)
        .bind(record.image_type.as_str())
        .bind(format_timestamp(record.delete_date)?)
        .execute(&mut **conn)
        .await
        .with_context(|| format!("Failed to queue server delete {}", record.id))?;
        Ok(())
    }

    async fn get_server_deletes(&self) -> anyhow::Result<Vec<ServerDeleteRecord>> {
        let mut conn = self.state.conn().await?;
        sqlx::query(
            r#"SELECT id, organization_id, project_id, image_ids, image_type, delete_date, revision
            FROM server_delete_queue ORDER BY seq ASC"#,
        )
        .fetch_all(&mut **conn)
        .await?
        .iter()
        .map(|record| {
            let image_ids: String = record.try_get("image_ids")?;
            let image_type: String = record.try_get("image_type")?;
            let delete_date: String = record.try_get("delete_date")?;
            Ok(ServerDeleteRecord {
                id: record.try_get("id")?,
                organization_id: record.try_get("organization_id")?,
                project_id: record.try_get("project_id")?,
                image_ids: lenient_string_list(&image_ids),
                image_type: ResourceType::decode(&image_type),
                delete_date: decode_timestamp(&delete_date),
                revision: record.try_get("revision")?,
            })
        })
        .collect()
    }

    async fn remove_server_delete(&self, id: &str, revision: i64) -> anyhow::Result<bool> {
        let mut conn = self.state.conn().await?;
        let result =
            sqlx::query(r#"DELETE FROM server_delete_queue WHERE id = $1 AND revision = $2"#)
                .bind(id)
                .bind(revision)
            .execute(&mut **conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
