use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::core::db::ServerDeleteRepository;
use crate::queue::scheduled::{DrainJob, DrainReport};
use crate::remote::media::MediaClient;

/// Retries remote media deletions that failed in the foreground.
pub struct ServerDeleteJob<Q> {
    queue: Q,
    media: Arc<dyn MediaClient>,
}

impl<Q: ServerDeleteRepository + Send + Sync + 'static> ServerDeleteJob<Q> {
    pub fn new(queue: Q, media: Arc<dyn MediaClient>) -> Self {
        Self { queue, media }
    }
}

#[async_trait]
impl<Q: ServerDeleteRepository + Send + Sync + 'static> DrainJob for ServerDeleteJob<Q> {
    fn name(&self) -> &'static str {
        "server_delete"
    }

    async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let records = match self.queue.get_server_deletes().await {
            Ok(records) => records,
            Err(e) => {
                error!(queue = "server_delete", error = %e, "failed to read server delete queue");
                return report;
            }
        };

        for record in records {
            let result = self
                .media
                .delete(
                    record.image_type,
                    &record.organization_id,
                    &record.project_id,
                    &record.image_ids,
                )
                .await;
            match result {
                Ok(()) => match self
                    .queue
                    .remove_server_delete(&record.id, record.revision)
                    .await
                {
                    Ok(_) => report.record_success(),
                    Err(e) => {
                        error!(
                            queue = "server_delete",
                            entry_id = %record.id,
                            error = %e,
                            "deleted but could not dequeue"
                        );
                        report.record_failure(&record.id);
                    }
                },
                Err(e) => {
                    warn!(
                        queue = "server_delete",
                        entry_id = %record.id,
                        error = %e,
                        "remote delete failed, keeping for next pass"
                    );
                    report.record_failure(&record.id);
                }
            }
        }
        report
    }
}
