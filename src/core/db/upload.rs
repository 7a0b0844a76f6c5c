use std::future::Future;

use time::OffsetDateTime;

use crate::core::db::model::ResourceType;
use crate::core::store::MediaType;

/// A media transfer that has not been confirmed by the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadQueueEntry {
    pub id: String,
    pub media_type: MediaType,
    pub resource_type: ResourceType,
    pub organization_id: String,
    pub project_id: String,
    pub item_id: String,
    pub local_uri: String,
    pub upload_date: OffsetDateTime,
    /// Bumped by the queue on every overwrite. Ignored on enqueue.
    pub revision: i64,
}

pub trait UploadQueueRepository {
    /// Insert, or overwrite the entry with the same id.
    fn enqueue_upload(
        &self,
        entry: &UploadQueueEntry,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
    /// All entries in the order they were first queued.
    fn get_uploads(&self) -> impl Future<Output = anyhow::Result<Vec<UploadQueueEntry>>> + Send;
    fn get_upload_by_id(
        &self,
        id: &str,
    ) -> impl Future<Output = anyhow::Result<Option<UploadQueueEntry>>> + Send;
    /// Remove the entry unless it was overwritten after being read at
    /// `revision`. Returns whether an entry was removed.
    fn remove_upload(
        &self,
        id: &str,
        revision: i64,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send;
}
