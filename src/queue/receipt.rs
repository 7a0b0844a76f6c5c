//! Cross-project receipt replication.
//!
//! A receipt captured against one project may carry line items billable to
//! other projects. Each queued receipt is copied into every target project
//! store; targets that are not mounted are asked for through the active
//! registry and tried again on a later pass.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::cache::StoreCache;
use crate::core::db::{ReceiptQueueEntry, ReceiptQueueRepository};
use crate::core::registry::ActiveEntityRegistry;
use crate::core::store::{Cents, Receipt, Row, Store, TableKind, WorkItemCostEntry};
use crate::queue::scheduled::{DrainJob, DrainReport};

const REPLICA_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_2c3a_8b54_4e0f_9a27_51c4_e8b3_0d96);

/// Row id of the receipt copy in `target`.
pub fn replica_receipt_id(purchase_id: &str, target_project_id: &str) -> String {
    Uuid::new_v5(
        &REPLICA_NAMESPACE,
        format!("receipt:{}:{}", purchase_id, target_project_id).as_bytes(),
    )
    .to_string()
}

/// Row id of the cost entry copied from line item `index` into `target`.
pub fn replica_cost_entry_id(purchase_id: &str, target_project_id: &str, index: usize) -> String {
    Uuid::new_v5(
        &REPLICA_NAMESPACE,
        format!("cost:{}:{}:{}", purchase_id, target_project_id, index).as_bytes(),
    )
    .to_string()
}

/// Copy the receipt and its line items for `target` into `store`.
///
/// Row ids derive from the purchase and the target, so applying the same
/// copy again overwrites the earlier rows instead of adding to them. Copy
/// rows left by an earlier version of the purchase are removed, and a
/// target the entry no longer names loses its copy entirely. Returns the
/// number of cost entries written.
pub fn replicate_to_target(store: &Store, entry: &ReceiptQueueEntry, target: &str) -> usize {
    let items: Vec<_> = entry.line_items_for(target).collect();
    let receipt_id = replica_receipt_id(&entry.purchase_id, target);
    let cost_ids: Vec<String> = items
        .iter()
        .map(|(index, _)| replica_cost_entry_id(&entry.purchase_id, target, *index))
        .collect();

    let stale: Vec<String> = store
        .rows(TableKind::WorkItemCostEntries)
        .into_iter()
        .filter(|record| {
            record
                .row
                .as_cost_entry()
                .is_some_and(|cost| cost.parent_id.as_deref() == Some(receipt_id.as_str()))
                && !cost_ids.contains(&record.id)
        })
        .map(|record| record.id)
        .collect();
    for id in &stale {
        store.delete_row(TableKind::WorkItemCostEntries, id);
    }

    if items.is_empty() {
        store.delete_row(TableKind::Receipts, &receipt_id);
        return 0;
    }

    let amount: Cents = items.iter().map(|(_, item)| item.amount).sum();
    store.upsert_row(
        receipt_id.clone(),
        Row::Receipts(Receipt {
            vendor: entry.vendor_ref.clone(),
            description: items
                .iter()
                .map(|(_, item)| item.item_description.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            amount,
            purchase_id: Some(entry.purchase_id.clone()),
            image_id: entry.image_id.clone(),
            receipt_date: Some(entry.created_at),
            accounting_id: None,
            copied_from: Some(entry.from_project_id.clone()),
        }),
    );
    for ((_, item), id) in items.iter().zip(cost_ids) {
        store.upsert_row(
            id,
            Row::WorkItemCostEntries(WorkItemCostEntry {
                work_item_id: None,
                parent_id: Some(receipt_id.clone()),
                label: item.item_description.clone(),
                amount: item.amount,
            }),
        );
    }
    items.len()
}

pub struct ReceiptReplicationJob<Q> {
    queue: Q,
    cache: Arc<StoreCache>,
    registry: Arc<ActiveEntityRegistry>,
    authenticated: watch::Receiver<bool>,
}

impl<Q: ReceiptQueueRepository + Send + Sync + 'static> ReceiptReplicationJob<Q> {
    pub fn new(
        queue: Q,
        cache: Arc<StoreCache>,
        registry: Arc<ActiveEntityRegistry>,
        authenticated: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            cache,
            registry,
            authenticated,
        }
    }

    /// Process one entry. Returns the targets still waiting for a mount.
    /// Copies are on disk before this returns.
    async fn replicate(&self, entry: &ReceiptQueueEntry) -> Vec<String> {
        let mut waiting = Vec::new();
        for target in entry.pending_targets() {
            // Fetch fresh every time; the store may have been unmounted
            // since the last pass.
            match self.cache.get(&target) {
                Some(store) => {
                    let rows = replicate_to_target(&store, entry, &target);
                    self.cache.flush(&target).await;
                    debug!(
                        queue = "receipt",
                        entry_id = %entry.id,
                        target = %target,
                        rows,
                        "receipt replicated"
                    );
                }
                None => {
                    debug!(
                        queue = "receipt",
                        entry_id = %entry.id,
                        target = %target,
                        "target not mounted, requesting it"
                    );
                    self.registry.add([target.clone()]);
                    waiting.push(target);
                }
            }
        }
        waiting
    }
}

#[async_trait]
impl<Q: ReceiptQueueRepository + Send + Sync + 'static> DrainJob for ReceiptReplicationJob<Q> {
    fn name(&self) -> &'static str {
        "receipt"
    }

    fn is_ready(&self) -> bool {
        *self.authenticated.borrow()
    }

    async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let entries = match self.queue.get_receipts().await {
            Ok(entries) => entries,
            Err(e) => {
                error!(queue = "receipt", error = %e, "failed to read receipt queue");
                return report;
            }
        };

        for entry in entries {
            let waiting = self.replicate(&entry).await;
            if waiting.is_empty() {
                match self.queue.remove_receipt(&entry.id, entry.revision).await {
                    Ok(true) => {
                        info!(queue = "receipt", entry_id = %entry.id, "receipt fully replicated");
                        report.record_success();
                    }
                    Ok(false) => {
                        debug!(
                            queue = "receipt",
                            entry_id = %entry.id,
                            "receipt re-queued during the pass, keeping the newer version"
                        );
                        report.record_skip();
                    }
                    Err(e) => {
                        error!(
                            queue = "receipt",
                            entry_id = %entry.id,
                            error = %e,
                            "replicated but could not dequeue"
                        );
                        report.record_failure(&entry.id);
                    }
                }
                continue;
            }

            if entry.remaining_targets.as_ref() != Some(&waiting)
                && let Err(e) = self
                    .queue
                    .set_remaining_targets(&entry.id, entry.revision, &waiting)
                    .await
            {
                // Replays are harmless: the copy rows have fixed ids.
                warn!(
                    queue = "receipt",
                    entry_id = %entry.id,
                    error = %e,
                    "could not record remaining targets"
                );
            }
            report.record_skip();
        }
        report
    }
}
