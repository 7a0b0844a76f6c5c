//! Foreground actions that feed the background queues.
//!
//! Each action first does its work locally, then tries the network once.
//! Anything that cannot reach the remote side right now is queued for the
//! scheduled drains instead of failing the action.

use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::db::{
    NewReceiptQueueEntry, ReceiptLineItem, ReceiptQueueRepository, ResourceType,
    ServerDeleteRecord, ServerDeleteRepository, UploadQueueEntry, UploadQueueRepository,
};
use crate::core::store::{
    MediaEntry, MediaType, Receipt, Row, Store, TableKind, WorkItemCostEntry,
};
use crate::error::{OpResult, TransportError};
use crate::remote::media::{GeoPoint, MediaClient, MediaTarget, UploadRequest};

/// One item picked in the media picker.
#[derive(Debug, Clone)]
pub struct SelectedMedia {
    pub media_type: MediaType,
    pub local_uri: String,
    pub location: Option<GeoPoint>,
    pub captured_at: Option<OffsetDateTime>,
}

/// Media selected for one "add media" action. Owned by the request, so two
/// screens adding media at the same time never see each other's picks.
#[derive(Debug, Clone)]
pub struct AddMediaRequest {
    pub organization_id: String,
    pub project_id: String,
    pub resource_type: ResourceType,
    /// Row the media belongs to, such as a receipt; the media row itself
    /// when absent.
    pub item_id: Option<String>,
    pub selected: Vec<SelectedMedia>,
}

impl AddMediaRequest {
    pub fn new(
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
        resource_type: ResourceType,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            project_id: project_id.into(),
            resource_type,
            item_id: None,
            selected: Vec::new(),
        }
    }

    pub fn select(mut self, media: SelectedMedia) -> Self {
        self.selected.push(media);
        self
    }
}

/// Record selected media in the project store and upload it. Uploads that
/// fail are queued under the media row's id. Returns one result per item;
/// a queued item still counts as a success for the caller, an item that
/// could be neither uploaded nor queued is reported as failed.
pub async fn add_media<U>(
    store: &Store,
    media: &dyn MediaClient,
    uploads: &U,
    request: AddMediaRequest,
) -> Vec<OpResult>
where
    U: UploadQueueRepository + Sync,
{
    let mut results = Vec::with_capacity(request.selected.len());
    for selected in &request.selected {
        let row = MediaEntry {
            media_type: selected.media_type,
            local_uri: selected.local_uri.clone(),
            item_id: request.item_id.clone(),
            remote_id: None,
            captured_at: selected.captured_at,
        };
        let media_id = store.insert_row(Row::MediaEntries(row.clone())).id;
        let item_id = request.item_id.clone().unwrap_or_else(|| media_id.clone());

        let uploaded = match upload_now(media, &request, &item_id, selected).await {
            Ok(remote_id) => {
                if let Some(remote_id) = remote_id {
                    let mut uploaded = row;
                    uploaded.remote_id = Some(remote_id);
                    store.update_row(&media_id, Row::MediaEntries(uploaded));
                }
                debug!(entity_id = %request.project_id, entry_id = %media_id, "media uploaded");
                Ok(())
            }
            Err(e) => {
                warn!(
                    entity_id = %request.project_id,
                    entry_id = %media_id,
                    error = %e,
                    "media upload failed, queueing"
                );
                uploads
                    .enqueue_upload(&UploadQueueEntry {
                        id: media_id.clone(),
                        media_type: selected.media_type,
                        resource_type: request.resource_type,
                        organization_id: request.organization_id.clone(),
                        project_id: request.project_id.clone(),
                        item_id,
                        local_uri: selected.local_uri.clone(),
                        upload_date: OffsetDateTime::now_utc(),
                        revision: 0,
                    })
                    .await
            }
        };
        match uploaded {
            Ok(()) => results.push(OpResult::success(media_id)),
            Err(e) => {
                error!(
                    entity_id = %request.project_id,
                    entry_id = %media_id,
                    error = %e,
                    "media neither uploaded nor queued"
                );
                results.push(OpResult::failed(media_id, format!("{:#}", e)));
            }
        }
    }
    results
}

async fn upload_now(
    media: &dyn MediaClient,
    request: &AddMediaRequest,
    item_id: &str,
    selected: &SelectedMedia,
) -> Result<Option<String>, TransportError> {
    let mut upload = UploadRequest::from_local_file(
        MediaTarget {
            resource_type: request.resource_type,
            media_type: selected.media_type,
            organization_id: &request.organization_id,
            project_id: &request.project_id,
            item_id,
        },
        &selected.local_uri,
    )
    .await?;
    upload.location = selected.location;
    upload.captured_at = selected.captured_at;
    Ok(media.upload(upload).await?.id)
}

/// Delete media rows locally and their uploaded copies remotely. A failed
/// remote delete is queued; the local delete is never rolled back.
pub async fn delete_media<D>(
    store: &Store,
    media: &dyn MediaClient,
    deletes: &D,
    organization_id: &str,
    project_id: &str,
    resource_type: ResourceType,
    media_ids: &[String],
) -> anyhow::Result<OpResult>
where
    D: ServerDeleteRepository + Sync,
{
    let mut remote_ids = Vec::new();
    let mut removed = 0usize;
    for id in media_ids {
        let remote_id = store
            .row(TableKind::MediaEntries, id)
            .and_then(|record| record.row.as_media().and_then(|m| m.remote_id.clone()));
        if store.delete_row(TableKind::MediaEntries, id).is_success() {
            removed += 1;
            remote_ids.extend(remote_id);
        }
    }
    let id = media_ids.join(",");
    if removed == 0 {
        return Ok(OpResult::not_found(id, "no such media"));
    }
    if remote_ids.is_empty() {
        return Ok(OpResult::success(id));
    }

    if let Err(e) = media
        .delete(resource_type, organization_id, project_id, &remote_ids)
        .await
    {
        warn!(entity_id = %project_id, error = %e, "remote media delete failed, queueing");
        deletes
            .enqueue_server_delete(&ServerDeleteRecord {
                id: Uuid::new_v4().to_string(),
                organization_id: organization_id.to_string(),
                project_id: project_id.to_string(),
                image_ids: remote_ids,
                image_type: resource_type,
                delete_date: OffsetDateTime::now_utc(),
                revision: 0,
            })
            .await?;
    }
    Ok(OpResult::success(id))
}

/// Save a receipt in its own project and queue the line items that belong
/// to other projects for replication.
pub async fn capture_receipt<R>(
    store: &Store,
    receipts: &R,
    project_id: &str,
    mut receipt: Receipt,
    line_items: Vec<ReceiptLineItem>,
) -> anyhow::Result<OpResult>
where
    R: ReceiptQueueRepository + Sync,
{
    let purchase_id = receipt
        .purchase_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    receipt.purchase_id = Some(purchase_id.clone());

    let is_local =
        |item: &ReceiptLineItem| item.project_id.is_empty() || item.project_id == project_id;
    receipt.amount = line_items
        .iter()
        .filter(|item| is_local(item))
        .map(|item| item.amount)
        .sum();
    let receipt_id = store.insert_row(Row::Receipts(receipt.clone())).id;
    for item in line_items.iter().filter(|item| is_local(item)) {
        store.insert_row(Row::WorkItemCostEntries(WorkItemCostEntry {
            work_item_id: None,
            parent_id: Some(receipt_id.clone()),
            label: item.item_description.clone(),
            amount: item.amount,
        }));
    }

    if line_items.iter().any(|item| !is_local(item)) {
        let entry = receipts
            .enqueue_receipt(&NewReceiptQueueEntry {
                purchase_id,
                from_project_id: project_id.to_string(),
                vendor_ref: receipt.vendor.clone(),
                image_id: receipt.image_id.clone(),
                line_items,
            })
            .await?;
        info!(
            entity_id = %project_id,
            entry_id = %entry.id,
            targets = entry.target_project_ids().len(),
            "receipt queued for replication"
        );
    }
    Ok(OpResult::success(receipt_id))
}
