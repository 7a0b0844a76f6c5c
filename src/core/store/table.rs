use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Money is held as integer cents so sums are exact.
pub type Cents = i64;

/// The fixed set of tables every project store carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TableKind {
    WorkItemSummaries,
    Receipts,
    Invoices,
    WorkItemCostEntries,
    MediaEntries,
    Notes,
    ChangeOrders,
    ChangeOrderItems,
}

impl TableKind {
    pub const ALL: [TableKind; 8] = [
        TableKind::WorkItemSummaries,
        TableKind::Receipts,
        TableKind::Invoices,
        TableKind::WorkItemCostEntries,
        TableKind::MediaEntries,
        TableKind::Notes,
        TableKind::ChangeOrders,
        TableKind::ChangeOrderItems,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TableKind::WorkItemSummaries => "workItemSummaries",
            TableKind::Receipts => "receipts",
            TableKind::Invoices => "invoices",
            TableKind::WorkItemCostEntries => "workItemCostEntries",
            TableKind::MediaEntries => "mediaEntries",
            TableKind::Notes => "notes",
            TableKind::ChangeOrders => "changeOrders",
            TableKind::ChangeOrderItems => "changeOrderItems",
        }
    }
}

impl TryFrom<&str> for TableKind {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        TableKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| anyhow::anyhow!("Unknown table kind: {}", value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemSummary {
    pub code: String,
    pub name: String,
    pub bid_amount: Cents,
    /// Derived from the cost entries pointing at this work item.
    #[serde(default)]
    pub spent_amount: Cents,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub vendor: String,
    #[serde(default)]
    pub description: String,
    pub amount: Cents,
    #[serde(default)]
    pub purchase_id: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub receipt_date: Option<OffsetDateTime>,
    #[serde(default)]
    pub accounting_id: Option<String>,
    /// Origin project when this row was replicated from another project.
    #[serde(default)]
    pub copied_from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub invoice_number: String,
    pub vendor: String,
    pub amount: Cents,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub invoice_date: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemCostEntry {
    /// Work item this cost is booked against, if allocated yet.
    #[serde(default)]
    pub work_item_id: Option<String>,
    /// Receipt or invoice row the cost came from.
    #[serde(default)]
    pub parent_id: Option<String>,
    pub label: String,
    pub amount: Cents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MediaType {
    Photo,
    Video,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Photo => "photo",
            MediaType::Video => "video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaEntry {
    pub media_type: MediaType,
    pub local_uri: String,
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub captured_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub body: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOrderStatus {
    Draft,
    Submitted,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeOrder {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: ChangeOrderStatus,
    /// Derived from this change order's items.
    #[serde(default)]
    pub total_amount: Cents,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeOrderItem {
    pub change_order_id: String,
    pub label: String,
    pub amount: Cents,
}

/// One row of any table. The variant decides which table it lives in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "data", rename_all = "camelCase")]
pub enum Row {
    WorkItemSummaries(WorkItemSummary),
    Receipts(Receipt),
    Invoices(Invoice),
    WorkItemCostEntries(WorkItemCostEntry),
    MediaEntries(MediaEntry),
    Notes(Note),
    ChangeOrders(ChangeOrder),
    ChangeOrderItems(ChangeOrderItem),
}

impl Row {
    pub fn table(&self) -> TableKind {
        match self {
            Row::WorkItemSummaries(_) => TableKind::WorkItemSummaries,
            Row::Receipts(_) => TableKind::Receipts,
            Row::Invoices(_) => TableKind::Invoices,
            Row::WorkItemCostEntries(_) => TableKind::WorkItemCostEntries,
            Row::MediaEntries(_) => TableKind::MediaEntries,
            Row::Notes(_) => TableKind::Notes,
            Row::ChangeOrders(_) => TableKind::ChangeOrders,
            Row::ChangeOrderItems(_) => TableKind::ChangeOrderItems,
        }
    }

    pub fn as_work_item(&self) -> Option<&WorkItemSummary> {
        match self {
            Row::WorkItemSummaries(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_cost_entry(&self) -> Option<&WorkItemCostEntry> {
        match self {
            Row::WorkItemCostEntries(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_receipt(&self) -> Option<&Receipt> {
        match self {
            Row::Receipts(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_media(&self) -> Option<&MediaEntry> {
        match self {
            Row::MediaEntries(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_change_order(&self) -> Option<&ChangeOrder> {
        match self {
            Row::ChangeOrders(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_change_order_item(&self) -> Option<&ChangeOrderItem> {
        match self {
            Row::ChangeOrderItems(row) => Some(row),
            _ => None,
        }
    }
}
