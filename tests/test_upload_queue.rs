//! Integration tests for upload recovery.
//!
//! Tests cover:
//! - A missing local file fails the entry without aborting the pass
//! - Offline passes never reach the network
//! - Every pending entry is retried once connectivity returns
//! - Successful retries dequeue and point the media row at the upload
//! - A pass leaves exactly the failed entries plus newly queued ones

mod common;

use sitebook::core::store::{MediaEntry, MediaType};

use common::*;

#[tokio::test]
async fn test_missing_file_is_kept_and_reported() -> anyhow::Result<()> {
    // 1. Queue an upload whose file does not exist
    let env = create_test_env().await;
    let missing = format!("file://{}", env.dir.path().join("gone.jpg").display());
    env.app.queues.enqueue_upload(&make_upload_entry("u1", "p1", &missing)).await?;

    // 2. Drain
    let outcome = env.app.upload_drain().run_pass().await;

    // 3. Recorded as failed, still queued, nothing sent
    let report = outcome.report().expect("pass ran");
    assert_eq!(report.attempted, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failed_ids, ["u1"]);
    assert!(env.app.queues.get_upload_by_id("u1").await?.is_some());
    assert_eq!(env.media.upload_calls(), 0);

    Ok(())
}

#[tokio::test]
async fn test_offline_pass_makes_no_network_calls() -> anyhow::Result<()> {
    // 1. Offline, one entry queued
    let env = create_test_env().await;
    env.app.connectivity.set_online(false);
    let uri = write_media_file(env.dir.path(), "a.jpg");
    env.app.queues.enqueue_upload(&make_upload_entry("u1", "p1", &uri)).await?;

    // 2. Immediate pass is declined
    let outcome = env.app.upload_drain().run_pass().await;
    assert_eq!(outcome, PassOutcome::Skipped(SkipReason::Offline));

    // 3. Nothing touched
    assert_eq!(env.media.calls(), 0);
    assert_eq!(env.app.queues.get_uploads().await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_reconnect_retries_every_pending_entry() -> anyhow::Result<()> {
    // 1. Three entries queued while offline
    let env = create_test_env().await;
    env.app.connectivity.set_online(false);
    for id in ["u1", "u2", "u3"] {
        let uri = write_media_file(env.dir.path(), &format!("{}.jpg", id));
        env.app.queues.enqueue_upload(&make_upload_entry(id, "p1", &uri)).await?;
    }
    let drain = env.app.upload_drain();
    let handle = drain.start();
    assert_eq!(env.media.calls(), 0);

    // 2. Back online
    env.app.connectivity.set_online(true);
    eventually("queue drained", || env.media.upload_calls() == 3).await;
    eventually("pass finished", || !drain.is_running()).await;

    // 3. All retried, all dequeued
    let mut uploaded = env.media.uploaded_items();
    uploaded.sort();
    assert_eq!(uploaded, ["u1", "u2", "u3"]);
    assert!(env.app.queues.get_uploads().await?.is_empty());

    handle.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_failed_retry_keeps_entry_for_next_pass() -> anyhow::Result<()> {
    // 1. Endpoint failing
    let env = create_test_env().await;
    env.media.set_failing(true);
    let uri = write_media_file(env.dir.path(), "a.jpg");
    env.app.queues.enqueue_upload(&make_upload_entry("u1", "p1", &uri)).await?;
    let drain = env.app.upload_drain();

    let outcome = drain.run_pass().await;
    assert_eq!(outcome.report().unwrap().failed, 1);
    assert_eq!(env.app.queues.get_uploads().await?.len(), 1);

    // 2. Endpoint recovers
    env.media.set_failing(false);
    let outcome = drain.run_pass().await;
    assert_eq!(outcome.report().unwrap().succeeded, 1);
    assert!(env.app.queues.get_uploads().await?.is_empty());
    assert_eq!(env.media.upload_calls(), 2);

    Ok(())
}

#[tokio::test]
async fn test_success_records_remote_id_on_mounted_store() -> anyhow::Result<()> {
    // 1. Mounted project with a media row not yet uploaded
    let env = create_test_env().await;
    env.app.directory.upsert(ProjectInfo::new("p1", "Kitchen remodel"));
    env.app.registry.add(["p1"]);
    env.app.controller.reconcile().await;
    let store = env.app.cache.get("p1").expect("p1 mounted");
    let uri = write_media_file(env.dir.path(), "a.jpg");
    store.upsert_row(
        "m1",
        Row::MediaEntries(MediaEntry {
            media_type: MediaType::Photo,
            local_uri: uri.clone(),
            item_id: None,
            remote_id: None,
            captured_at: None,
        }),
    );
    env.app.queues.enqueue_upload(&make_upload_entry("m1", "p1", &uri)).await?;

    // 2. Drain
    env.app.upload_drain().run_pass().await;

    // 3. The row now points at the uploaded copy
    let record = store.row(TableKind::MediaEntries, "m1").expect("row exists");
    assert_eq!(record.row.as_media().unwrap().remote_id.as_deref(), Some("remote-m1"));
    assert!(env.app.queues.get_uploads().await?.is_empty());

    env.app.controller.detach_all().await;
    Ok(())
}

#[tokio::test]
async fn test_survivors_are_exactly_the_failed_entries() -> anyhow::Result<()> {
    // 1. One good entry, one with a missing file
    let env = create_test_env().await;
    let good = write_media_file(env.dir.path(), "a.jpg");
    let missing = format!("file://{}", env.dir.path().join("gone.jpg").display());
    env.app.queues.enqueue_upload(&make_upload_entry("good", "p1", &good)).await?;
    env.app.queues.enqueue_upload(&make_upload_entry("bad", "p1", &missing)).await?;
    let drain = env.app.upload_drain();

    // 2. Pass, then new foreground work
    let first = drain.run_pass().await;
    env.app.queues.enqueue_upload(&make_upload_entry("late", "p1", &good)).await?;

    // 3. Only the failure and the new entry remain, in queue order
    let report = first.report().unwrap();
    assert_eq!((report.succeeded, report.failed), (1, 1));
    let remaining: Vec<String> =
        env.app.queues.get_uploads().await?.into_iter().map(|u| u.id).collect();
    assert_eq!(remaining, ["bad", "late"]);

    // 4. The next pass picks up the new entry and keeps the failure
    let second = drain.run_pass().await;
    assert_eq!(second.report().unwrap().attempted, 2);
    let remaining: Vec<String> =
        env.app.queues.get_uploads().await?.into_iter().map(|u| u.id).collect();
    assert_eq!(remaining, ["bad"]);

    Ok(())
}
