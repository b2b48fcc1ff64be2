//! Job lifecycle integration tests: retries, watchdog, cancellation,
//! deletion, restart recovery and scratch cleanup.

mod common;

use std::path::Path;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{Script, TestHarness};
use reelforge::{EncodeRequest, ImportRequest};
use reelforge_common::{Codec, EncodingStatus, Error, MediaId};
use reelforge_db::queries::encodings;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Retries and the watchdog
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_retry_up_to_the_ceiling() {
    let h = TestHarness::new();
    h.profile(Codec::H264, 240);
    let media = h.import("flaky.mp4", 10.0, 480).await;
    h.tools
        .script("libx264", Script::Fail("Conversion failed!".into()));

    h.orchestrator
        .encode(EncodeRequest::new(media.id))
        .await
        .unwrap();

    // First attempt plus three retries.
    assert_eq!(h.drain().await, 4);
    assert_eq!(h.tools.commands().len(), 4);

    let records = h.encodings(media.id);
    assert_eq!(records.len(), 1, "retries supersede the failed record");
    assert_eq!(records[0].status, EncodingStatus::Fail);
    assert_eq!(records[0].retries, 3);
    assert!(records[0].logs.contains("Conversion failed!"));
    assert_eq!(h.media(media.id).encoding_status, EncodingStatus::Fail);
}

#[tokio::test]
async fn a_retry_that_succeeds_clears_the_failure() {
    let h = TestHarness::new();
    h.profile(Codec::H264, 240);
    let media = h.import("flaky.mp4", 10.0, 480).await;
    h.tools
        .script_times("libx264", Script::Fail("Conversion failed!".into()), 1);

    h.orchestrator
        .encode(EncodeRequest::new(media.id))
        .await
        .unwrap();
    assert_eq!(h.drain().await, 2);

    let records = h.encodings(media.id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, EncodingStatus::Success);
    assert_eq!(records[0].retries, 1);
}

#[tokio::test]
async fn disk_full_is_not_retried() {
    let h = TestHarness::new();
    h.profile(Codec::H264, 240);
    let media = h.import("big.mp4", 10.0, 480).await;
    h.tools.script(
        "libx264",
        Script::Fail("av_interleaved_write_frame(): No space left on device".into()),
    );

    h.orchestrator
        .encode(EncodeRequest::new(media.id))
        .await
        .unwrap();
    assert_eq!(h.drain().await, 1);

    let records = h.encodings(media.id);
    assert_eq!(records[0].status, EncodingStatus::Fail);
    assert_eq!(records[0].retries, 0);
}

#[tokio::test]
async fn runaway_encoders_are_killed_by_the_watchdog() {
    let h = TestHarness::with_config(|c| c.timeouts.encode_secs = 1);
    h.profile(Codec::H264, 240);
    let media = h.import("stuck.mp4", 10.0, 480).await;
    h.tools.script("libx264", Script::Block);

    h.orchestrator
        .encode(EncodeRequest::new(media.id))
        .await
        .unwrap();
    assert_eq!(h.drain().await, 1);

    assert_eq!(h.tools.kills(), 1);
    let records = h.encodings(media.id);
    assert_eq!(records.len(), 1, "timeouts are not retried");
    assert_eq!(records[0].status, EncodingStatus::Fail);
    assert!(records[0].logs.contains("killed after exceeding 1s"));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelling_a_running_job_kills_it_and_drops_the_record() {
    let h = TestHarness::new();
    h.profile(Codec::H264, 240);
    h.profile(Codec::Vp9, 240);
    let media = h.import("clip.mp4", 10.0, 480).await;
    h.tools.script("libvpx-vp9", Script::Block);

    h.orchestrator
        .encode(EncodeRequest::new(media.id))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let pool = tokio::spawn(h.workers(2).run(cancel.clone()));
    let media_id = media.id;
    h.wait_for("h264 done and vp9 blocked", |h| {
        h.tools.blocked() == 1
            && h.encodings(media_id)
                .iter()
                .any(|e| e.status == EncodingStatus::Success)
    })
    .await;

    let running = h
        .encodings(media.id)
        .into_iter()
        .find(|e| e.status == EncodingStatus::Running)
        .unwrap();
    assert!(h.orchestrator.processes().is_tracked(running.id));

    assert!(h.orchestrator.cancel_encoding(running.id).await.unwrap());

    h.wait_for("kill", |h| h.tools.kills() == 1).await;
    assert!(h.encoding(running.id).is_none());

    // The sibling is untouched.
    let left = h.encodings(media.id);
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].status, EncodingStatus::Success);

    cancel.cancel();
    pool.await.unwrap();
    assert!(!h.orchestrator.processes().is_tracked(running.id));
}

#[tokio::test]
async fn finished_jobs_cannot_be_cancelled() {
    let h = TestHarness::new();
    h.profile(Codec::H264, 240);
    let media = h.import("clip.mp4", 10.0, 480).await;
    h.orchestrator
        .encode(EncodeRequest::new(media.id))
        .await
        .unwrap();
    h.drain().await;
    let done = h.encodings(media.id).remove(0);

    let err = h.orchestrator.cancel_encoding(done.id).await.unwrap_err();
    assert_matches!(err, Error::Conflict(_));
    assert!(h.encoding(done.id).is_some());
}

#[tokio::test]
async fn cancelling_a_queued_job_skips_it_later() {
    let h = TestHarness::new();
    h.profile(Codec::H264, 240);
    let media = h.import("clip.mp4", 10.0, 480).await;
    let report = h
        .orchestrator
        .encode(EncodeRequest::new(media.id))
        .await
        .unwrap();

    assert!(h.orchestrator.cancel_encoding(report.queued[0]).await.unwrap());
    assert_eq!(h.drain().await, 1);
    assert!(h.tools.commands().is_empty());
    assert!(h.encodings(media.id).is_empty());
    assert_eq!(h.media(media.id).encoding_status, EncodingStatus::Pending);

    let missing = reelforge_common::EncodingId::new();
    assert!(!h.orchestrator.cancel_encoding(missing).await.unwrap());
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deleting_a_media_removes_everything_it_produced() {
    let h = TestHarness::new();
    h.profile(Codec::H264, 240);
    h.profile(Codec::Vp9, 240);
    let media = h.import("clip.mp4", 10.0, 480).await;
    h.orchestrator
        .encode(EncodeRequest::new(media.id))
        .await
        .unwrap();
    h.drain().await;

    let outputs: Vec<String> = h
        .encodings(media.id)
        .into_iter()
        .filter_map(|e| e.output_path)
        .collect();
    assert_eq!(outputs.len(), 2);
    let manifest = h.media(media.id).manifest_path.unwrap();
    assert!(Path::new(&manifest).exists());

    assert!(h.orchestrator.delete_media(media.id).await.unwrap());

    for output in &outputs {
        assert!(!Path::new(output).exists());
    }
    assert!(!Path::new(&manifest).exists());
    assert!(!h.config.storage.hls_dir.join(&media.uid).exists());
    assert!(encodings::list_for_media(&h.conn(), media.id)
        .unwrap()
        .is_empty());
    assert!(Path::new(&media.source_path).exists(), "sources are left alone");

    assert!(!h.orchestrator.delete_media(media.id).await.unwrap());
}

// ---------------------------------------------------------------------------
// Import and seeding
// ---------------------------------------------------------------------------

#[tokio::test]
async fn importing_a_missing_file_fails() {
    let h = TestHarness::new();
    let err = h
        .orchestrator
        .import_media(ImportRequest {
            source: h.dir.path().join("nope.mp4"),
            owner: "alice".into(),
            uid: None,
            title: None,
        })
        .await
        .unwrap_err();
    assert_matches!(err, Error::NotFound(_));
}

#[tokio::test]
async fn imported_media_carries_probed_properties() {
    let h = TestHarness::new();
    let media = h.import("holiday.mov", 42.5, 720).await;

    assert_eq!(media.title, "holiday");
    assert_eq!(media.owner, "alice");
    assert_eq!(media.duration_secs, 42.5);
    assert_eq!(media.height, 720);
    assert_eq!(media.encoding_status, EncodingStatus::Pending);
    assert!(Path::new(&media.source_path).is_absolute());
}

#[tokio::test]
async fn seeding_profiles_is_idempotent() {
    let h = TestHarness::new();
    assert_eq!(h.orchestrator.seed_profiles().unwrap(), 10);
    assert_eq!(h.orchestrator.seed_profiles().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Restart recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interrupted_jobs_are_failed_and_retried_on_startup() {
    let h = TestHarness::new();
    h.profile(Codec::H264, 240);
    let media = h.import("clip.mp4", 10.0, 480).await;
    let report = h
        .orchestrator
        .encode(EncodeRequest::new(media.id))
        .await
        .unwrap();
    let stale = report.queued[0];

    // Simulate a crash mid-encode.
    assert!(encodings::mark_running(&h.conn(), stale).unwrap());

    let recovery = h.orchestrator.recover().await.unwrap();
    assert_eq!(recovery.interrupted, 1);
    assert_eq!(recovery.requeued, 1);

    h.drain().await;

    let records = h.encodings(media.id);
    assert_eq!(records.len(), 1);
    assert_ne!(records[0].id, stale);
    assert_eq!(records[0].status, EncodingStatus::Success);
    assert_eq!(records[0].retries, 1);
}

#[cfg(unix)]
#[tokio::test]
async fn recovery_leaves_processes_that_reused_a_recorded_pid() {
    let h = TestHarness::new();
    h.profile(Codec::H264, 240);
    let media = h.import("clip.mp4", 10.0, 480).await;
    let report = h
        .orchestrator
        .encode(EncodeRequest::new(media.id))
        .await
        .unwrap();
    let stale = report.queued[0];

    let mut bystander = tokio::process::Command::new("sleep")
        .arg("30")
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    assert!(encodings::mark_running(&h.conn(), stale).unwrap());
    assert!(encodings::set_pid(&h.conn(), stale, bystander.id()).unwrap());

    let recovery = h.orchestrator.recover().await.unwrap();
    assert_eq!(recovery.interrupted, 1);

    let exited = tokio::time::timeout(Duration::from_millis(300), bystander.wait()).await;
    assert!(exited.is_err(), "unrelated process exited: {exited:?}");
    bystander.kill().await.unwrap();
}

#[tokio::test]
async fn pending_jobs_are_requeued_on_startup() {
    let h = TestHarness::new();
    h.profile(Codec::H264, 240);
    let media = h.import("clip.mp4", 10.0, 480).await;
    h.orchestrator
        .encode(EncodeRequest::new(media.id))
        .await
        .unwrap();

    // A fresh process starts with an empty queue.
    while h.queue.try_next().is_some() {}

    let recovery = h.orchestrator.recover().await.unwrap();
    assert_eq!(recovery.interrupted, 0);
    assert_eq!(recovery.requeued, 1);
    assert_eq!(h.drain().await, 1);
    assert_eq!(h.encodings(media.id)[0].status, EncodingStatus::Success);
}

// ---------------------------------------------------------------------------
// Scratch cleanup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn orphan_sweep_removes_stale_scratch_only() {
    let h = TestHarness::with_config(|c| c.encoding.orphan_max_age_secs = 0);

    let chunks = h.config.chunks_dir();
    let orphan = chunks.join("no-such-group");
    std::fs::create_dir_all(&orphan).unwrap();
    let work = h.config.work_dir().join("encode-abc");
    std::fs::create_dir_all(&work).unwrap();
    let hls_scratch = h.config.storage.hls_dir.join(".uid-123");
    let hls_live = h.config.storage.hls_dir.join("uid");
    std::fs::create_dir_all(&hls_scratch).unwrap();
    std::fs::create_dir_all(&hls_live).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.orchestrator.sweep_orphans().unwrap(), 3);

    assert!(!orphan.exists());
    assert!(!work.exists());
    assert!(!hls_scratch.exists());
    assert!(hls_live.exists());
}

#[tokio::test]
async fn orphan_sweep_keeps_known_groups() {
    let h = TestHarness::with_config(|c| {
        c.encoding.orphan_max_age_secs = 0;
        c.encoding.chunking_threshold_secs = 300.0;
        c.encoding.chunk_duration_secs = 300;
    });
    h.profile(Codec::H264, 240);
    let media = h.import("feature.mp4", 900.0, 480).await;
    h.orchestrator
        .encode(EncodeRequest::new(media.id))
        .await
        .unwrap();
    let key = h.encodings(media.id)[0].chunk_group_key.clone().unwrap();

    h.orchestrator.sweep_orphans().unwrap();
    assert!(h.config.chunks_dir().join(&key).exists());
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_pool_processes_jobs_until_cancelled() {
    let h = TestHarness::new();
    h.profile(Codec::H264, 240);
    h.profile(Codec::H264, 360);
    let media = h.import("clip.mp4", 10.0, 480).await;

    let cancel = CancellationToken::new();
    let pool = tokio::spawn(h.workers(2).run(cancel.clone()));

    h.orchestrator
        .encode(EncodeRequest::new(media.id))
        .await
        .unwrap();

    let media_id: MediaId = media.id;
    h.wait_for("both renditions", |h| {
        h.encodings(media_id)
            .iter()
            .filter(|e| e.status == EncodingStatus::Success)
            .count()
            == 2
    })
    .await;

    cancel.cancel();
    pool.await.unwrap();
    assert!(h.queue.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_mid_encode_untracks_the_job() {
    let h = TestHarness::new();
    h.profile(Codec::H264, 240);
    let media = h.import("clip.mp4", 10.0, 480).await;
    h.tools.script("libx264", Script::Block);

    h.orchestrator
        .encode(EncodeRequest::new(media.id))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let pool = tokio::spawn(h.workers(1).run(cancel.clone()));
    h.wait_for("encoder running", |h| h.tools.blocked() == 1).await;
    assert_eq!(h.orchestrator.processes().len(), 1);

    cancel.cancel();
    pool.await.unwrap();

    assert!(h.orchestrator.processes().is_empty());
    // The record stays running for startup recovery to pick up.
    assert_eq!(h.encodings(media.id)[0].status, EncodingStatus::Running);
}
