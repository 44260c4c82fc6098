//! Shared helpers for integration tests.
#![allow(dead_code)]

pub mod range_server;

use qdm_core::config::QdmConfig;
use qdm_core::engine::Engine;
use qdm_core::events::Event;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;

/// Engine over a temp download dir with fast test-friendly defaults.
pub async fn test_engine(download_dir: &Path) -> Engine {
    let cfg = QdmConfig {
        download_dir: download_dir.to_path_buf(),
        max_concurrent_downloads: 3,
        max_segments_per_download: 4,
        ..QdmConfig::default()
    };
    Engine::new(cfg).await.expect("engine")
}

/// Waits until the download reaches a terminal event. Panics on the wrong
/// terminal state or on timeout.
pub async fn wait_for_completion(rx: &mut broadcast::Receiver<Event>, id: &str, timeout: Duration) {
    match wait_terminal(rx, id, timeout).await {
        Event::DownloadCompleted { .. } => {}
        other => panic!("expected completion for {id}, got {other:?}"),
    }
}

pub async fn wait_for_failure(rx: &mut broadcast::Receiver<Event>, id: &str, timeout: Duration) {
    match wait_terminal(rx, id, timeout).await {
        Event::DownloadFailed { .. } => {}
        other => panic!("expected failure for {id}, got {other:?}"),
    }
}

async fn wait_terminal(rx: &mut broadcast::Receiver<Event>, id: &str, timeout: Duration) -> Event {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for terminal event of {id}"))
            .expect("event bus closed");
        match &event {
            Event::DownloadCompleted { id: eid }
            | Event::DownloadFailed { id: eid, .. }
            | Event::DownloadCancelled { id: eid } => {
                if eid == id {
                    return event;
                }
            }
            _ => {}
        }
    }
}

/// Waits for `download:paused` of the given id.
pub async fn wait_for_pause(rx: &mut broadcast::Receiver<Event>, id: &str, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for pause of {id}"))
            .expect("event bus closed");
        if let Event::DownloadPaused { id: eid } = &event {
            if eid == id {
                return;
            }
        }
    }
}

/// Waits until some progress (downloaded > threshold) has been reported.
pub async fn wait_for_progress(
    rx: &mut broadcast::Receiver<Event>,
    id: &str,
    threshold: u64,
    timeout: Duration,
) -> u64 {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for progress of {id}"))
            .expect("event bus closed");
        if let Event::DownloadProgress { id: eid, downloaded, .. } = &event {
            if eid == id && *downloaded > threshold {
                return *downloaded;
            }
        }
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
