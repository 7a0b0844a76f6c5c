//! Derived summary fields.
//!
//! Totals are never written by hand: they are recomputed from the child rows
//! every time those rows change, inside the mutating call.

use std::collections::HashMap;

use tracing::debug;

use crate::core::directory::TemplateItem;
use crate::core::store::{
    Cents, Change, ListenerId, Row, Store, StoreHandle, TableKind, WorkItemSummary,
};

pub const TOTAL_BID_KEY: &str = "totalBid";
pub const TOTAL_SPENT_KEY: &str = "totalSpent";

/// Keeps the derived fields of one store current while attached.
#[derive(Debug)]
pub struct AggregateUpdater {
    store: StoreHandle,
    listener: ListenerId,
}

impl AggregateUpdater {
    pub fn attach(store: &StoreHandle) -> Self {
        let listener = store.add_listener(on_change);
        recompute_all(store);
        Self {
            store: store.clone(),
            listener,
        }
    }

    pub fn detach(self) {
        self.store.remove_listener(self.listener);
    }
}

fn on_change(store: &Store, change: &Change) {
    if change.touches(TableKind::WorkItemCostEntries)
        || change.touches(TableKind::WorkItemSummaries)
    {
        recompute_work_items(store);
    }
    if change.touches(TableKind::ChangeOrderItems) || change.touches(TableKind::ChangeOrders) {
        recompute_change_orders(store);
    }
}

pub fn recompute_all(store: &Store) {
    recompute_work_items(store);
    recompute_change_orders(store);
}

fn recompute_work_items(store: &Store) {
    let cost_entries = store.rows(TableKind::WorkItemCostEntries);
    let mut spent_by_item: HashMap<&str, Cents> = HashMap::new();
    let mut total_spent: Cents = 0;
    for record in &cost_entries {
        if let Some(entry) = record.row.as_cost_entry() {
            total_spent += entry.amount;
            if let Some(item) = entry.work_item_id.as_deref() {
                *spent_by_item.entry(item).or_default() += entry.amount;
            }
        }
    }

    let mut total_bid: Cents = 0;
    for record in store.rows(TableKind::WorkItemSummaries) {
        let Some(summary) = record.row.as_work_item() else {
            continue;
        };
        total_bid += summary.bid_amount;
        let spent = spent_by_item.get(record.id.as_str()).copied().unwrap_or(0);
        if summary.spent_amount != spent {
            debug!(
                store_id = %store.id(),
                work_item = %record.id,
                spent,
                "work item spent recomputed"
            );
            let mut updated = summary.clone();
            updated.spent_amount = spent;
            store.upsert_row(record.id.clone(), Row::WorkItemSummaries(updated));
        }
    }

    store.set_value(TOTAL_SPENT_KEY, total_spent.into());
    store.set_value(TOTAL_BID_KEY, total_bid.into());
}

fn recompute_change_orders(store: &Store) {
    let mut totals: HashMap<String, Cents> = HashMap::new();
    for record in store.rows(TableKind::ChangeOrderItems) {
        if let Some(item) = record.row.as_change_order_item() {
            *totals.entry(item.change_order_id.clone()).or_default() += item.amount;
        }
    }
    for record in store.rows(TableKind::ChangeOrders) {
        let Some(order) = record.row.as_change_order() else {
            continue;
        };
        let total = totals.get(&record.id).copied().unwrap_or(0);
        if order.total_amount != total {
            let mut updated = order.clone();
            updated.total_amount = total;
            store.upsert_row(record.id.clone(), Row::ChangeOrders(updated));
        }
    }
}

pub fn total_spent(store: &Store) -> Cents {
    store
        .value(TOTAL_SPENT_KEY)
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}

pub fn total_bid(store: &Store) -> Cents {
    store
        .value(TOTAL_BID_KEY)
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}

/// Materialize a starter template into a project that has no work items yet.
/// Returns how many rows were created; zero when the project already has
/// work items.
pub fn seed_from_template(store: &Store, template: &[TemplateItem]) -> usize {
    if store.row_count(TableKind::WorkItemSummaries) > 0 {
        return 0;
    }
    for item in template {
        store.insert_row(Row::WorkItemSummaries(WorkItemSummary {
            code: item.code.clone(),
            name: item.name.clone(),
            bid_amount: item.bid_amount,
            spent_amount: 0,
        }));
    }
    template.len()
}
