use std::future::Future;

use time::OffsetDateTime;

use crate::core::db::model::ResourceType;

/// A remote media deletion that has not been confirmed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDeleteRecord {
    pub id: String,
    pub organization_id: String,
    pub project_id: String,
    pub image_ids: Vec<String>,
    pub image_type: ResourceType,
    pub delete_date: OffsetDateTime,
    /// Bumped by the queue on every overwrite. Ignored on enqueue.
    pub revision: i64,
}

pub trait ServerDeleteRepository {
    fn enqueue_server_delete(
        &self,
        record: &ServerDeleteRecord,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn get_server_deletes(
        &self,
    ) -> impl Future<Output = anyhow::Result<Vec<ServerDeleteRecord>>> + Send;
    /// Same contract as `UploadQueueRepository::remove_upload`.
    fn remove_server_delete(
        &self,
        id: &str,
        revision: i64,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send;
}
