use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sitebook::App;
use sitebook::config::AppConfig;
use sitebook::core::db::{
    NewReceiptQueueEntry, QueueDb, ReceiptLineItem, ResourceType, UploadQueueEntry,
};
use sitebook::core::store::{Cents, MediaType, Row, WorkItemCostEntry};
use tempfile::TempDir;
use time::OffsetDateTime;

use super::mocks::{MockAccounting, MockMediaClient, MockTransport};

/// Signed-in config rooted in `dir` with fast reconnects.
pub fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.data_dir = dir.to_path_buf();
    config.remote.auth_token = Some("test-token".to_string());
    config.sync.reconnect_min_ms = 10;
    config.sync.reconnect_max_ms = 50;
    config.accounting.debounce_ms = 20;
    config
}

/// An app wired to mock remote collaborators.
/// The temp directory must be kept alive for the app's lifetime.
pub struct TestEnv {
    pub app: App,
    pub transport: Arc<MockTransport>,
    pub media: Arc<MockMediaClient>,
    pub accounting: Arc<MockAccounting>,
    pub dir: TempDir,
}

pub async fn create_test_env() -> TestEnv {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let transport = MockTransport::new();
    let media = MockMediaClient::new();
    let accounting = MockAccounting::new();
    let app = App::open(
        test_config(dir.path()),
        transport.clone(),
        media.clone(),
        accounting.clone(),
    )
    .await
    .expect("Failed to open test app");
    TestEnv {
        app,
        transport,
        media,
        accounting,
        dir,
    }
}

/// A queue database in a fresh temp directory.
pub async fn create_queue_db() -> (QueueDb, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let queues = QueueDb::open(dir.path().join("queues.db"))
        .await
        .expect("Failed to open queue database");
    (queues, dir)
}

/// Write a small media file and return its path as a `file://` URI.
pub fn write_media_file(dir: &Path, name: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, b"\xff\xd8\xff fake jpeg").expect("Failed to write media file");
    format!("file://{}", path.display())
}

pub fn make_upload_entry(id: &str, project_id: &str, local_uri: &str) -> UploadQueueEntry {
    UploadQueueEntry {
        id: id.to_string(),
        media_type: MediaType::Photo,
        resource_type: ResourceType::Photo,
        organization_id: "org1".to_string(),
        project_id: project_id.to_string(),
        item_id: id.to_string(),
        local_uri: local_uri.to_string(),
        upload_date: OffsetDateTime::now_utc(),
        revision: 0,
    }
}

pub fn line_item(description: &str, amount: Cents, project_id: &str) -> ReceiptLineItem {
    ReceiptLineItem {
        item_description: description.to_string(),
        amount,
        project_id: project_id.to_string(),
    }
}

pub fn make_receipt_entry(
    purchase_id: &str,
    from_project_id: &str,
    line_items: Vec<ReceiptLineItem>,
) -> NewReceiptQueueEntry {
    NewReceiptQueueEntry {
        purchase_id: purchase_id.to_string(),
        from_project_id: from_project_id.to_string(),
        vendor_ref: "Lumber Yard".to_string(),
        image_id: None,
        line_items,
    }
}

pub fn cost_row(work_item_id: Option<&str>, amount: Cents) -> Row {
    Row::WorkItemCostEntries(WorkItemCostEntry {
        work_item_id: work_item_id.map(str::to_string),
        parent_id: None,
        label: format!("cost {}", amount),
        amount,
    })
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
