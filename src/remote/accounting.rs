//! Best-effort bookkeeping against the external accounting system.
//!
//! Nothing in here may hold up a store mount or unmount: every failure is
//! logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::directory::{ProjectDirectory, ProjectInfo};
use crate::error::TransportError;

#[async_trait]
pub trait AccountingClient: Send + Sync {
    /// False when no accounting system is configured; callers skip all work.
    fn enabled(&self) -> bool {
        true
    }
    async fn exists(&self, project: &ProjectInfo) -> Result<bool, TransportError>;
    /// Returns the accounting system's id for the new record.
    async fn create(&self, project: &ProjectInfo) -> Result<String, TransportError>;
    async fn update(&self, project: &ProjectInfo) -> Result<(), TransportError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledAccounting;

#[async_trait]
impl AccountingClient for DisabledAccounting {
    fn enabled(&self) -> bool {
        false
    }

    async fn exists(&self, _project: &ProjectInfo) -> Result<bool, TransportError> {
        Ok(true)
    }

    async fn create(&self, project: &ProjectInfo) -> Result<String, TransportError> {
        Ok(project.id.clone())
    }

    async fn update(&self, _project: &ProjectInfo) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Make sure the accounting system has a record for the project, creating
/// one when it does not.
pub async fn ensure_record(
    client: &dyn AccountingClient,
    directory: &ProjectDirectory,
    project_id: &str,
) {
    if !client.enabled() {
        return;
    }
    let Some(project) = directory.get(project_id) else {
        return;
    };
    if project.accounting_id.is_some() {
        match client.exists(&project).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!(entity_id = %project_id, error = %e, "accounting lookup failed");
                return;
            }
        }
    }
    match client.create(&project).await {
        Ok(accounting_id) => {
            info!(
                entity_id = %project_id,
                accounting_id = %accounting_id,
                "accounting record created"
            );
            directory.set_accounting_id(project_id, &accounting_id);
        }
        Err(e) => warn!(entity_id = %project_id, error = %e, "accounting record creation failed"),
    }
}

/// Push the project name to the accounting system whenever it changes,
/// once it has been stable for `debounce`.
pub async fn sync_name_changes(
    client: Arc<dyn AccountingClient>,
    directory: Arc<ProjectDirectory>,
    project_id: String,
    debounce: Duration,
) {
    if !client.enabled() {
        return;
    }
    let mut projects = directory.subscribe();
    let mut last_name = projects
        .borrow_and_update()
        .get(&project_id)
        .map(|p| p.name.clone());
    loop {
        if projects.changed().await.is_err() {
            return;
        }
        let name = projects
            .borrow_and_update()
            .get(&project_id)
            .map(|p| p.name.clone());
        if name.is_none() || name == last_name {
            continue;
        }

        // Restart the quiet period on every further change.
        loop {
            tokio::select! {
                changed = projects.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    projects.borrow_and_update();
                }
                _ = tokio::time::sleep(debounce) => break,
            }
        }

        let Some(project) = directory.get(&project_id) else {
            continue;
        };
        if Some(&project.name) == last_name.as_ref() {
            continue;
        }
        last_name = Some(project.name.clone());
        match client.update(&project).await {
            Ok(()) => debug!(entity_id = %project_id, "accounting record updated"),
            Err(e) => warn!(entity_id = %project_id, error = %e, "accounting update failed"),
        }
    }
}

/// Reconcile the record once, then follow name changes until aborted.
pub fn spawn_for_project(
    client: Arc<dyn AccountingClient>,
    directory: Arc<ProjectDirectory>,
    project_id: String,
    debounce: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        ensure_record(client.as_ref(), &directory, &project_id).await;
        sync_name_changes(client, directory, project_id, debounce).await;
    })
}
