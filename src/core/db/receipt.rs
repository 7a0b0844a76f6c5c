use std::collections::BTreeSet;
use std::future::Future;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::core::db::model::lenient_cents;
use crate::core::store::Cents;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptLineItem {
    pub item_description: String,
    pub amount: Cents,
    pub project_id: String,
}

/// A receipt whose line items must be copied into other projects.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptQueueEntry {
    /// Same as `purchase_id`.
    pub id: String,
    pub purchase_id: String,
    pub from_project_id: String,
    pub vendor_ref: String,
    pub image_id: Option<String>,
    pub line_items: Vec<ReceiptLineItem>,
    /// Targets still to process. `None` until the first pass touches the entry.
    pub remaining_targets: Option<Vec<String>>,
    /// Targets named by an earlier version of this purchase but not by the
    /// current one. Their copies are removed on the next pass.
    pub retired_targets: Vec<String>,
    pub created_at: OffsetDateTime,
    /// Bumped on every re-queue of the purchase.
    pub revision: i64,
}

#[derive(Debug, Clone)]
pub struct NewReceiptQueueEntry {
    pub purchase_id: String,
    pub from_project_id: String,
    pub vendor_ref: String,
    pub image_id: Option<String>,
    pub line_items: Vec<ReceiptLineItem>,
}

fn targets_of(line_items: &[ReceiptLineItem], from_project_id: &str) -> Vec<String> {
    line_items
        .iter()
        .map(|item| item.project_id.as_str())
        .filter(|id| !id.is_empty() && *id != from_project_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl NewReceiptQueueEntry {
    pub fn target_project_ids(&self) -> Vec<String> {
        targets_of(&self.line_items, &self.from_project_id)
    }
}

impl ReceiptQueueEntry {
    /// Distinct projects named by the line items, other than the origin.
    pub fn target_project_ids(&self) -> Vec<String> {
        targets_of(&self.line_items, &self.from_project_id)
    }

    /// Targets that have not been processed yet: current targets plus
    /// retired ones, restricted to the persisted remaining list once a pass
    /// has recorded one.
    pub fn pending_targets(&self) -> Vec<String> {
        let mut all: BTreeSet<String> = self.target_project_ids().into_iter().collect();
        all.extend(self.retired_targets.iter().cloned());
        match &self.remaining_targets {
            None => all.into_iter().collect(),
            Some(remaining) => all
                .into_iter()
                .filter(|target| remaining.contains(target))
                .collect(),
        }
    }

    pub fn line_items_for<'a>(
        &'a self,
        project_id: &'a str,
    ) -> impl Iterator<Item = (usize, &'a ReceiptLineItem)> + 'a {
        self.line_items
            .iter()
            .enumerate()
            .filter(move |(_, item)| item.project_id == project_id)
    }
}

/// Decode stored line items without ever failing. Unusable items are dropped
/// with a warning and bad amounts become zero.
pub(crate) fn decode_line_items(text: &str) -> Vec<ReceiptLineItem> {
    let values = match serde_json::from_str::<Vec<serde_json::Value>>(text) {
        Ok(values) => values,
        Err(e) => {
            warn!(error = %e, "malformed receipt line items, treating as empty");
            return Vec::new();
        }
    };
    values
        .into_iter()
        .filter_map(|value| {
            let Some(object) = value.as_object() else {
                warn!("receipt line item is not an object, skipping");
                return None;
            };
            let project_id = object
                .get("projectId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(ReceiptLineItem {
                item_description: object
                    .get("itemDescription")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                amount: object.get("amount").map(lenient_cents).unwrap_or(0),
                project_id,
            })
        })
        .collect()
}

pub trait ReceiptQueueRepository {
    /// Queue a receipt for replication. Re-queueing the same purchase
    /// overwrites the previous entry, resets its progress and retires the
    /// targets the new line items no longer name.
    fn enqueue_receipt(
        &self,
        entry: &NewReceiptQueueEntry,
    ) -> impl Future<Output = anyhow::Result<ReceiptQueueEntry>> + Send;
    fn get_receipts(&self) -> impl Future<Output = anyhow::Result<Vec<ReceiptQueueEntry>>> + Send;
    fn get_receipt_by_id(
        &self,
        id: &str,
    ) -> impl Future<Output = anyhow::Result<Option<ReceiptQueueEntry>>> + Send;
    /// Record progress for the entry read at `revision`. Returns false when
    /// the purchase was re-queued since.
    fn set_remaining_targets(
        &self,
        id: &str,
        revision: i64,
        remaining: &[String],
    ) -> impl Future<Output = anyhow::Result<bool>> + Send;
    /// Remove the entry read at `revision`. Returns false when it is gone
    /// or was re-queued since.
    fn remove_receipt(
        &self,
        id: &str,
        revision: i64,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(items: &[(&str, Cents)]) -> ReceiptQueueEntry {
        ReceiptQueueEntry {
            id: "pur-1".into(),
            purchase_id: "pur-1".into(),
            from_project_id: "origin".into(),
            vendor_ref: "Acme".into(),
            image_id: None,
            line_items: items
                .iter()
                .map(|(project, amount)| ReceiptLineItem {
                    item_description: "x".into(),
                    amount: *amount,
                    project_id: project.to_string(),
                })
                .collect(),
            remaining_targets: None,
            retired_targets: Vec::new(),
            created_at: OffsetDateTime::UNIX_EPOCH,
            revision: 1,
        }
    }

    #[test]
    fn targets_are_distinct_and_exclude_origin() {
        let e = entry(&[("p2", 1), ("origin", 2), ("p3", 3), ("p2", 4), ("", 5)]);
        assert_eq!(e.target_project_ids(), vec!["p2", "p3"]);
    }

    #[test]
    fn pending_targets_follow_remaining_list() {
        let mut e = entry(&[("p2", 1), ("p3", 3)]);
        assert_eq!(e.pending_targets(), vec!["p2", "p3"]);
        e.remaining_targets = Some(vec!["p3".into()]);
        assert_eq!(e.pending_targets(), vec!["p3"]);
        e.remaining_targets = Some(vec![]);
        assert!(e.pending_targets().is_empty());
    }

    #[test]
    fn retired_targets_stay_pending_until_processed() {
        let mut e = entry(&[("p3", 3)]);
        e.retired_targets = vec!["p2".into()];
        assert_eq!(e.target_project_ids(), vec!["p3"]);
        assert_eq!(e.pending_targets(), vec!["p2", "p3"]);
        e.remaining_targets = Some(vec!["p2".into()]);
        assert_eq!(e.pending_targets(), vec!["p2"]);
    }

    #[test]
    fn malformed_line_items_decode_to_defaults() {
        assert!(decode_line_items("{").is_empty());
        let items = decode_line_items(
            r#"[{"itemDescription":"Nails","amount":"12.5","projectId":"p2"},
                42,
                {"amount":true}]"#,
        );
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].amount, 13);
        assert_eq!(items[0].project_id, "p2");
        assert_eq!(items[1].amount, 0);
        assert_eq!(items[1].project_id, "");
    }
}
