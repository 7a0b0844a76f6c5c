use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::core::cache::StoreCache;
use crate::core::db::{UploadQueueEntry, UploadQueueRepository};
use crate::core::store::{Row, TableKind};
use crate::error::TransportError;
use crate::queue::scheduled::{DrainJob, DrainReport};
use crate::remote::media::{MediaClient, MediaTarget, UploadRequest};

/// Retries media uploads that failed in the foreground.
pub struct UploadRecoveryJob<Q> {
    queue: Q,
    media: Arc<dyn MediaClient>,
    cache: Arc<StoreCache>,
}

impl<Q: UploadQueueRepository + Send + Sync + 'static> UploadRecoveryJob<Q> {
    pub fn new(queue: Q, media: Arc<dyn MediaClient>, cache: Arc<StoreCache>) -> Self {
        Self { queue, media, cache }
    }

    async fn retry(&self, entry: &UploadQueueEntry) -> Result<Option<String>, TransportError> {
        // Location and capture time were not queued; the endpoint accepts
        // the upload without them.
        let request = UploadRequest::from_local_file(
            MediaTarget {
                resource_type: entry.resource_type,
                media_type: entry.media_type,
                organization_id: &entry.organization_id,
                project_id: &entry.project_id,
                item_id: &entry.item_id,
            },
            &entry.local_uri,
        )
        .await?;
        let response = self.media.upload(request).await?;
        Ok(response.id)
    }

    /// Point the media row at its uploaded copy, if the project happens to
    /// be mounted right now.
    fn record_remote_id(&self, entry: &UploadQueueEntry, remote_id: &str) {
        let Some(store) = self.cache.get(&entry.project_id) else {
            return;
        };
        let Some(record) = store.row(TableKind::MediaEntries, &entry.id) else {
            return;
        };
        if let Some(media) = record.row.as_media()
            && media.remote_id.as_deref() != Some(remote_id)
        {
            let mut updated = media.clone();
            updated.remote_id = Some(remote_id.to_string());
            store.update_row(&entry.id, Row::MediaEntries(updated));
        }
    }
}

#[async_trait]
impl<Q: UploadQueueRepository + Send + Sync + 'static> DrainJob for UploadRecoveryJob<Q> {
    fn name(&self) -> &'static str {
        "upload"
    }

    async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let entries = match self.queue.get_uploads().await {
            Ok(entries) => entries,
            Err(e) => {
                error!(queue = "upload", error = %e, "failed to read upload queue");
                return report;
            }
        };

        for entry in entries {
            match self.retry(&entry).await {
                Ok(remote_id) => {
                    if let Some(remote_id) = &remote_id {
                        self.record_remote_id(&entry, remote_id);
                    }
                    match self.queue.remove_upload(&entry.id, entry.revision).await {
                        Ok(removed) => {
                            debug!(
                                queue = "upload",
                                entry_id = %entry.id,
                                requeued = !removed,
                                "queued upload completed"
                            );
                            report.record_success();
                        }
                        Err(e) => {
                            error!(
                                queue = "upload",
                                entry_id = %entry.id,
                                error = %e,
                                "uploaded but could not dequeue"
                            );
                            report.record_failure(&entry.id);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        queue = "upload",
                        entry_id = %entry.id,
                        timeout = e.is_timeout(),
                        error = %e,
                        "queued upload failed, keeping for next pass"
                    );
                    report.record_failure(&entry.id);
                }
            }
        }
        report
    }
}
