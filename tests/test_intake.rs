//! Integration tests for the foreground actions that feed the queues.
//!
//! Tests cover:
//! - Adding media uploads immediately when possible
//! - Failed uploads are queued under the media row id
//! - Concurrent add-media requests keep their own selections
//! - An item that can be neither uploaded nor queued fails alone
//! - Deleting uploaded media, with queueing on remote failure

mod common;

use sitebook::OpStatus;
use sitebook::core::store::{MediaEntry, MediaType};
use sitebook::intake::{AddMediaRequest, SelectedMedia, add_media, delete_media};

use common::*;

fn photo(uri: &str) -> SelectedMedia {
    SelectedMedia {
        media_type: MediaType::Photo,
        local_uri: uri.to_string(),
        location: None,
        captured_at: None,
    }
}

#[tokio::test]
async fn test_add_media_uploads_and_records_remote_id() -> anyhow::Result<()> {
    let env = create_test_env().await;
    let store = Store::new(StoreId::per_entity("project", "p1"));
    let uri = write_media_file(env.dir.path(), "a.jpg");

    let results = add_media(
        &store,
        env.media.as_ref(),
        &env.app.queues,
        AddMediaRequest::new("org1", "p1", ResourceType::Photo).select(photo(&uri)),
    )
    .await;

    assert_eq!(results.len(), 1);
    let record = store.row(TableKind::MediaEntries, &results[0].id).expect("media row");
    let expected = format!("remote-{}", results[0].id);
    assert_eq!(record.row.as_media().unwrap().remote_id.as_deref(), Some(expected.as_str()));
    assert!(env.app.queues.get_uploads().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_failed_upload_is_queued_under_media_id() -> anyhow::Result<()> {
    // 1. Endpoint down
    let env = create_test_env().await;
    env.media.set_failing(true);
    let store = Store::new(StoreId::per_entity("project", "p1"));
    let uri = write_media_file(env.dir.path(), "a.jpg");

    let mut request =
        AddMediaRequest::new("org1", "p1", ResourceType::Receipt).select(photo(&uri));
    request.item_id = Some("receipt-7".to_string());
    let results = add_media(&store, env.media.as_ref(), &env.app.queues, request).await;

    // 2. Row kept locally, upload queued
    assert!(results[0].is_success());
    let queued = env.app.queues.get_upload_by_id(&results[0].id).await?.expect("queued");
    assert_eq!(queued.item_id, "receipt-7");
    assert_eq!(queued.resource_type, ResourceType::Receipt);
    assert_eq!(queued.local_uri, uri);
    let record = store.row(TableKind::MediaEntries, &results[0].id).expect("media row");
    assert!(record.row.as_media().unwrap().remote_id.is_none());

    Ok(())
}

/// Upload queue whose database is unavailable.
struct UnwritableQueue;

impl UploadQueueRepository for UnwritableQueue {
    async fn enqueue_upload(&self, entry: &UploadQueueEntry) -> anyhow::Result<()> {
        anyhow::bail!("disk full while queueing {}", entry.id)
    }

    async fn get_uploads(&self) -> anyhow::Result<Vec<UploadQueueEntry>> {
        Ok(Vec::new())
    }

    async fn get_upload_by_id(&self, _id: &str) -> anyhow::Result<Option<UploadQueueEntry>> {
        Ok(None)
    }

    async fn remove_upload(&self, _id: &str, _revision: i64) -> anyhow::Result<bool> {
        Ok(false)
    }
}

#[tokio::test]
async fn test_unqueueable_items_fail_without_aborting_the_batch() -> anyhow::Result<()> {
    // 1. Endpoint down and queue unwritable
    let env = create_test_env().await;
    env.media.set_failing(true);
    let store = Store::new(StoreId::per_entity("project", "p1"));
    let a = write_media_file(env.dir.path(), "a.jpg");
    let b = write_media_file(env.dir.path(), "b.jpg");
    let request = AddMediaRequest::new("org1", "p1", ResourceType::Photo)
        .select(photo(&a))
        .select(photo(&b));

    let results = add_media(&store, env.media.as_ref(), &UnwritableQueue, request).await;

    // 2. Every item was tried and reported on its own
    assert_eq!(results.len(), 2);
    assert_eq!(env.media.upload_calls(), 2);
    for result in &results {
        assert_eq!(result.status, OpStatus::Failed);
        assert!(result.message.contains("disk full"));
        assert!(store.row(TableKind::MediaEntries, &result.id).is_some());
    }

    Ok(())
}

#[tokio::test]
async fn test_concurrent_requests_keep_their_own_selection() -> anyhow::Result<()> {
    let env = create_test_env().await;
    let p1 = Store::new(StoreId::per_entity("project", "p1"));
    let p2 = Store::new(StoreId::per_entity("project", "p2"));
    let a = write_media_file(env.dir.path(), "a.jpg");
    let b = write_media_file(env.dir.path(), "b.jpg");
    let c = write_media_file(env.dir.path(), "c.jpg");

    let first = AddMediaRequest::new("org1", "p1", ResourceType::Photo)
        .select(photo(&a))
        .select(photo(&b));
    let second = AddMediaRequest::new("org1", "p2", ResourceType::Photo).select(photo(&c));
    let (first, second) = tokio::join!(
        add_media(&p1, env.media.as_ref(), &env.app.queues, first),
        add_media(&p2, env.media.as_ref(), &env.app.queues, second),
    );

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);
    assert_eq!(p1.row_count(TableKind::MediaEntries), 2);
    assert_eq!(p2.row_count(TableKind::MediaEntries), 1);

    Ok(())
}

#[tokio::test]
async fn test_delete_media_removes_locally_and_remotely() -> anyhow::Result<()> {
    let env = create_test_env().await;
    let store = Store::new(StoreId::per_entity("project", "p1"));
    store.upsert_row(
        "m1",
        Row::MediaEntries(MediaEntry {
            media_type: MediaType::Photo,
            local_uri: "file:///tmp/a.jpg".into(),
            item_id: None,
            remote_id: Some("img-1".into()),
            captured_at: None,
        }),
    );

    let result = delete_media(
        &store,
        env.media.as_ref(),
        &env.app.queues,
        "org1",
        "p1",
        ResourceType::Photo,
        &["m1".to_string()],
    )
    .await?;

    assert!(result.is_success());
    assert_eq!(store.row_count(TableKind::MediaEntries), 0);
    assert_eq!(env.media.deleted_ids(), ["img-1"]);
    assert!(env.app.queues.get_server_deletes().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_failed_remote_delete_is_queued_and_drained() -> anyhow::Result<()> {
    // 1. Remote delete fails
    let env = create_test_env().await;
    env.media.set_failing(true);
    let store = Store::new(StoreId::per_entity("project", "p1"));
    store.upsert_row(
        "m1",
        Row::MediaEntries(MediaEntry {
            media_type: MediaType::Photo,
            local_uri: "file:///tmp/a.jpg".into(),
            item_id: None,
            remote_id: Some("img-1".into()),
            captured_at: None,
        }),
    );
    let result = delete_media(
        &store,
        env.media.as_ref(),
        &env.app.queues,
        "org1",
        "p1",
        ResourceType::Photo,
        &["m1".to_string()],
    )
    .await?;

    // 2. Local row gone anyway, remote delete queued
    assert!(result.is_success());
    assert_eq!(store.row_count(TableKind::MediaEntries), 0);
    let queued = env.app.queues.get_server_deletes().await?;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].image_ids, ["img-1"]);

    // 3. The delete queue finishes the job once the endpoint recovers
    env.media.set_failing(false);
    let outcome = env.app.server_delete_drain().run_pass().await;
    assert_eq!(outcome.report().unwrap().succeeded, 1);
    assert!(env.app.queues.get_server_deletes().await?.is_empty());
    assert_eq!(env.media.deleted_ids(), ["img-1"]);

    Ok(())
}

#[tokio::test]
async fn test_delete_unknown_media_is_not_found() -> anyhow::Result<()> {
    let env = create_test_env().await;
    let store = Store::new(StoreId::per_entity("project", "p1"));
    let result = delete_media(
        &store,
        env.media.as_ref(),
        &env.app.queues,
        "org1",
        "p1",
        ResourceType::Photo,
        &["ghost".to_string()],
    )
    .await?;
    assert_eq!(result.status, OpStatus::NotFound);
    assert_eq!(env.media.delete_calls(), 0);
    Ok(())
}
