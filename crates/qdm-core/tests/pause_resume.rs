//! Pause/resume, cancellation promptness, and crash recovery.

mod common;

use common::range_server::{self, RangeServerOptions};
use qdm_core::engine::AddRequest;
use qdm_core::events::Event;
use qdm_core::store::records::{Download, DownloadStatus, Segment, SegmentState};
use qdm_core::store::{unix_timestamp, Store};
use std::collections::HashMap;
use std::time::Duration;
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(60);

fn throttled() -> RangeServerOptions {
    RangeServerOptions {
        throttle: Some((16 * 1024, Duration::from_millis(25))),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_stops_workers_and_resume_is_byte_exact() {
    let body = range_server::patterned_body(4 * 1024 * 1024, 11);
    let url = range_server::start_with_options(body.clone(), throttled());

    let dir = tempdir().unwrap();
    let engine = common::test_engine(dir.path()).await;
    let mut rx = engine.subscribe();
    let mut progress_rx = engine.subscribe();

    let id = engine
        .add(AddRequest {
            url,
            autostart: true,
            ..Default::default()
        })
        .await
        .unwrap();

    // Let the transfer get going, then pause.
    common::wait_for_progress(&mut rx, &id, 64 * 1024, WAIT).await;
    engine.pause(&id).await.unwrap();
    common::wait_for_pause(&mut rx, &id, Duration::from_secs(5)).await;

    let paused = engine.get(&id).unwrap();
    assert_eq!(paused.status, DownloadStatus::Paused);
    assert!(paused.downloaded > 0);
    assert!(paused.downloaded < body.len() as u64, "paused mid-transfer");
    assert_eq!(paused.downloaded, paused.segment_sum(), "counter matches segments");

    // After the pause event no worker is alive: part-files must be static.
    let store = Store::open(dir.path()).unwrap();
    let sizes_at_pause: Vec<u64> = paused
        .segments
        .iter()
        .map(|s| file_len(&store.part_path(&id, s.id)))
        .collect();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let sizes_later: Vec<u64> = paused
        .segments
        .iter()
        .map(|s| file_len(&store.part_path(&id, s.id)))
        .collect();
    assert_eq!(sizes_at_pause, sizes_later, "no bytes appended after pause");

    // Part-file bytes line up with their segment's slice of the source.
    let mut part_prefixes: HashMap<u32, Vec<u8>> = HashMap::new();
    for seg in &paused.segments {
        let path = store.part_path(&id, seg.id);
        if path.exists() {
            part_prefixes.insert(seg.id, std::fs::read(path).unwrap());
        }
    }

    // Double-pause is refused while nothing is running.
    assert!(engine.pause(&id).await.is_err());

    engine.resume(&id).await.unwrap();
    common::wait_for_completion(&mut rx, &id, WAIT).await;

    let record = engine.get(&id).unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
    let content = std::fs::read(record.final_path()).unwrap();
    assert_eq!(common::sha256(&content), common::sha256(&body));

    for seg in &record.segments {
        if let Some(prefix) = part_prefixes.get(&seg.id) {
            let start = seg.offset as usize;
            assert_eq!(
                &content[start..start + prefix.len()],
                prefix.as_slice(),
                "final bytes match the pre-assembly part-file of segment {}",
                seg.id
            );
        }
    }

    // Progress is monotonic across the pause boundary.
    let mut last: HashMap<String, u64> = HashMap::new();
    while let Ok(event) = progress_rx.try_recv() {
        if let Event::DownloadProgress { id: eid, downloaded, .. } = event {
            let prev = last.entry(eid).or_insert(0);
            assert!(downloaded >= *prev, "progress never decreases");
            *prev = downloaded;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_deletes_scratch_and_stops() {
    let body = range_server::patterned_body(4 * 1024 * 1024, 13);
    let url = range_server::start_with_options(body, throttled());

    let dir = tempdir().unwrap();
    let engine = common::test_engine(dir.path()).await;
    let mut rx = engine.subscribe();

    let id = engine
        .add(AddRequest {
            url,
            autostart: true,
            ..Default::default()
        })
        .await
        .unwrap();
    common::wait_for_progress(&mut rx, &id, 64 * 1024, WAIT).await;

    engine.cancel(&id).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("cancel event in time")
            .unwrap();
        if matches!(&event, Event::DownloadCancelled { id: eid } if eid == &id) {
            break;
        }
    }

    let record = engine.get(&id).unwrap();
    assert_eq!(record.status, DownloadStatus::Stopped);
    assert!(!dir.path().join(".qdm_data").join(&id).exists(), "scratch removed");

    // Stopped downloads can be removed.
    engine.remove(&id).await.unwrap();
    assert!(engine.get(&id).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crash_recovery_resumes_from_part_files() {
    let body = range_server::patterned_body(1_000_000, 17);
    let url = range_server::start(body.clone());

    let dir = tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();

    // Fabricate the on-disk state of a process killed mid-download: the
    // record still says `downloading`, part-files hold partial bytes, and one
    // part-file is longer than its persisted counter (write raced the flush).
    let id = "crashed0000000000000000000000000".to_string();
    let seg_len = 250_000u64;
    let persisted = [100_000u64, 40_000, 0, 250_000];
    let on_disk = [100_000u64, 52_000, 0, 250_000]; // segment 1 ahead of its counter
    let scratch = store.scratch_dir(&id);
    std::fs::create_dir_all(&scratch).unwrap();

    let mut segments = Vec::new();
    for i in 0..4u32 {
        let offset = i as u64 * seg_len;
        let disk = on_disk[i as usize] as usize;
        if disk > 0 {
            let slice = &body[offset as usize..offset as usize + disk];
            std::fs::write(store.part_path(&id, i), slice).unwrap();
        }
        segments.push(Segment {
            id: i,
            offset,
            length: Some(seg_len),
            downloaded: persisted[i as usize],
            state: if persisted[i as usize] == seg_len {
                SegmentState::Finished
            } else {
                SegmentState::Running
            },
        });
    }
    let record = Download {
        id: id.clone(),
        source_url: url,
        request_headers: HashMap::new(),
        file_name: "file.bin".to_string(),
        name_override: None,
        save_dir: dir.path().to_path_buf(),
        total_size: Some(1_000_000),
        resumable: true,
        status: DownloadStatus::Downloading,
        segments,
        max_segments: 4,
        downloaded: persisted.iter().sum(),
        progress_pct: 0.0,
        speed_bps: 999, // stale, must be zeroed on recovery
        eta_s: None,
        date_added: unix_timestamp(),
        date_completed: None,
        last_error: None,
    };
    store.persist_downloads(&[record]).await.unwrap();

    // Fresh load: the record is rewritten to paused with zeroed speed.
    let engine = common::test_engine(dir.path()).await;
    let recovered = engine.get(&id).unwrap();
    assert_eq!(recovered.status, DownloadStatus::Paused);
    assert_eq!(recovered.speed_bps, 0);

    let mut rx = engine.subscribe();
    engine.resume(&id).await.unwrap();
    common::wait_for_completion(&mut rx, &id, WAIT).await;

    let record = engine.get(&id).unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
    assert_eq!(record.downloaded, 1_000_000);
    let content = std::fs::read(record.final_path()).unwrap();
    assert_eq!(common::sha256(&content), common::sha256(&body), "byte-equal after recovery");
}

fn file_len(path: &std::path::Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
