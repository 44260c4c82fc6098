//! Per-download supervisor task.
//!
//! Owns one run of one download: best-effort probe, segment planning, one
//! worker per unfinished segment, the 500 ms progress ticker, and the final
//! aggregation to assembled/paused/stopped/failed. The supervisor is the sole
//! writer of the download record; workers only send deltas.

use super::{EngineInner, StopKind};
use crate::assemble;
use crate::events::Event;
use crate::naming;
use crate::probe;
use crate::segmenter;
use crate::store::records::{DownloadStatus, SegmentState};
use crate::store::unix_timestamp;
use crate::worker::{self, SegmentJob, SegmentOutcome, WorkerMsg};
use crate::USER_AGENT;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

const PROGRESS_TICK: Duration = Duration::from_millis(500);
const PERSIST_INTERVAL: Duration = Duration::from_secs(3);

pub(crate) async fn run(
    engine: Arc<EngineInner>,
    id: String,
    abort: Arc<AtomicBool>,
    stop: Arc<StdMutex<Option<StopKind>>>,
) {
    if let Err(e) = drive(&engine, &id, &abort, &stop).await {
        tracing::error!(id = %id, "download failed: {e:#}");
        engine.with_download(&id, |d| {
            d.status = DownloadStatus::Failed;
            d.last_error = Some(format!("{e:#}"));
            d.speed_bps = 0;
            d.eta_s = None;
        });
        engine.clear_run(&id);
        engine.events.publish(Event::DownloadFailed {
            id: id.clone(),
            error: format!("{e:#}"),
        });
        if let Err(pe) = engine.persist_downloads().await {
            tracing::warn!(id = %id, "persist after failure: {pe:#}");
        }
        engine.kick();
    }
}

async fn drive(
    engine: &Arc<EngineInner>,
    id: &str,
    abort: &Arc<AtomicBool>,
    stop: &Arc<StdMutex<Option<StopKind>>>,
) -> anyhow::Result<()> {
    let Some(record) = engine.snapshot(id) else {
        return Ok(());
    };

    // First start: probe for metadata, settle the file name, plan segments.
    if record.segments.is_empty() {
        let url = record.source_url.clone();
        let headers = record.request_headers.clone();
        let probed = tokio::task::spawn_blocking(move || {
            probe::probe(&url, &headers, USER_AGENT)
        })
        .await?;

        match probed {
            Ok(p) => {
                engine.with_download(id, |d| {
                    d.source_url = p.final_url.clone();
                    d.total_size = p.total_size;
                    d.resumable = p.resumable;
                    d.file_name = naming::derive_file_name(
                        d.name_override.as_deref(),
                        p.content_disposition.as_deref(),
                        &d.source_url,
                        p.content_type.as_deref(),
                        &d.id,
                    );
                });
            }
            Err(e) => {
                // Soft failure: fall back to a single non-resumable stream.
                tracing::warn!(id = %id, "probe failed, proceeding without metadata: {e:#}");
                engine.with_download(id, |d| {
                    d.total_size = None;
                    d.resumable = false;
                });
            }
        }

        let taken: Vec<String> = engine
            .downloads_snapshot()
            .iter()
            .filter(|d| d.id != id && d.save_dir == record.save_dir)
            .map(|d| d.file_name.clone())
            .collect();
        engine.with_download(id, |d| {
            d.file_name = naming::unique_file_name(&d.file_name, &taken);
            d.segments = segmenter::plan_segments(d.total_size, d.resumable, d.max_segments);
            d.downloaded = 0;
        });
    }

    let record = engine.snapshot(id).ok_or_else(|| anyhow::anyhow!("download removed"))?;
    let single_direct = record.segments.len() == 1 && record.segments[0].length.is_none();
    let scratch = engine.store.scratch_dir(id);

    tokio::fs::create_dir_all(&record.save_dir).await?;
    if !single_direct {
        tokio::fs::create_dir_all(&scratch).await?;
    }
    if let Err(e) = engine.persist_downloads().await {
        tracing::warn!(id = %id, "persist after planning: {e:#}");
    }

    // One worker per non-finished segment, each reporting over the same
    // bounded channel. The supervisor applies deltas; no worker touches the
    // record directly.
    let (tx, mut rx) = mpsc::channel::<WorkerMsg>(256);
    let mut workers: JoinSet<(u32, SegmentOutcome)> = JoinSet::new();
    // A pause/cancel that raced the planning phase skips worker spawn entirely.
    let unfinished: Vec<_> = if abort.load(Ordering::Relaxed) {
        Vec::new()
    } else {
        record.segments.iter().filter(|s| !s.is_finished()).collect()
    };
    for seg in unfinished {
        let job = SegmentJob {
            segment_id: seg.id,
            url: record.source_url.clone(),
            headers: record.request_headers.clone(),
            user_agent: USER_AGENT.to_string(),
            part_path: if single_direct {
                record.final_path()
            } else {
                engine.store.part_path(id, seg.id)
            },
            offset: seg.offset,
            length: seg.length,
            downloaded: seg.downloaded,
            resumable: record.resumable,
        };
        engine.with_download(id, |d| {
            if let Some(s) = d.segments.iter_mut().find(|s| s.id == seg.id) {
                s.state = SegmentState::Running;
            }
        });
        let abort = Arc::clone(abort);
        let limiter = engine.limiter.clone();
        let tx = tx.clone();
        let sid = seg.id;
        workers.spawn_blocking(move || (sid, worker::run_segment(job, abort, limiter, tx)));
    }
    drop(tx);

    let mut ticker = tokio::time::interval(PROGRESS_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick_bytes = 0u64;
    let mut last_persist = Instant::now();
    let mut failure: Option<String> = None;
    let mut rx_open = true;
    let mut workers_open = !workers.is_empty();

    while rx_open || workers_open {
        tokio::select! {
            msg = rx.recv(), if rx_open => match msg {
                Some(msg) => apply_message(engine, id, msg, &mut tick_bytes),
                None => rx_open = false,
            },
            joined = workers.join_next(), if workers_open => match joined {
                Some(Ok((sid, outcome))) => apply_outcome(engine, id, sid, outcome, &mut failure),
                Some(Err(e)) => {
                    failure.get_or_insert_with(|| format!("worker task: {e}"));
                }
                None => workers_open = false,
            },
            _ = ticker.tick() => {
                publish_progress(engine, id, &mut tick_bytes);
                if last_persist.elapsed() >= PERSIST_INTERVAL {
                    if let Err(e) = engine.persist_downloads().await {
                        tracing::warn!(id = %id, "periodic persist: {e:#}");
                    }
                    last_persist = Instant::now();
                }
            }
        }
    }
    publish_progress(engine, id, &mut tick_bytes);

    let requested = *stop.lock().unwrap();
    match requested {
        Some(StopKind::Pause) => finish_paused(engine, id).await,
        Some(StopKind::Cancel) => finish_cancelled(engine, id, single_direct).await,
        None => {
            let all_finished = engine
                .with_download(id, |d| d.segments.iter().all(|s| s.is_finished()))
                .unwrap_or(false);
            if all_finished {
                finish_assembled(engine, id, single_direct, stop).await;
            } else {
                finish_failed(engine, id, failure).await;
            }
        }
    }
    Ok(())
}

fn apply_message(engine: &EngineInner, id: &str, msg: WorkerMsg, tick_bytes: &mut u64) {
    match msg {
        WorkerMsg::Chunk { segment_id, bytes } => {
            engine.with_download(id, |d| {
                if let Some(s) = d.segments.iter_mut().find(|s| s.id == segment_id) {
                    s.downloaded += bytes;
                    d.downloaded += bytes;
                }
            });
            *tick_bytes += bytes;
        }
        WorkerMsg::Rebase { segment_id, downloaded } => {
            engine.with_download(id, |d| {
                if let Some(s) = d.segments.iter_mut().find(|s| s.id == segment_id) {
                    d.downloaded = d
                        .downloaded
                        .saturating_sub(s.downloaded)
                        .saturating_add(downloaded);
                    s.downloaded = downloaded;
                }
            });
        }
        WorkerMsg::Redirect { url } => {
            tracing::debug!(id = %id, "segment redirect rewrote source url");
            engine.with_download(id, |d| d.source_url = url);
        }
    }
}

fn apply_outcome(
    engine: &EngineInner,
    id: &str,
    segment_id: u32,
    outcome: SegmentOutcome,
    failure: &mut Option<String>,
) {
    let state = match &outcome {
        SegmentOutcome::Finished => SegmentState::Finished,
        // A cancelled worker leaves its segment restartable.
        SegmentOutcome::Cancelled => SegmentState::NotStarted,
        SegmentOutcome::Failed(e) => {
            tracing::warn!(id = %id, segment = segment_id, "segment failed: {e}");
            *failure = Some(format!("segment {segment_id}: {e}"));
            SegmentState::Failed
        }
    };
    engine.with_download(id, |d| {
        if let Some(s) = d.segments.iter_mut().find(|s| s.id == segment_id) {
            s.state = state;
        }
    });
}

fn publish_progress(engine: &EngineInner, id: &str, tick_bytes: &mut u64) {
    let bytes = std::mem::take(tick_bytes);
    let snapshot = engine.with_download(id, |d| {
        // 500 ms tick → bytes/s.
        d.speed_bps = bytes * 2;
        d.recompute_progress();
        (d.downloaded, d.total_size, d.speed_bps, d.eta_s)
    });
    if let Some((downloaded, total_size, speed_bps, eta_s)) = snapshot {
        engine.events.publish(Event::DownloadProgress {
            id: id.to_string(),
            downloaded,
            total_size,
            speed_bps,
            eta_s,
        });
    }
}

async fn finish_paused(engine: &EngineInner, id: &str) {
    engine.with_download(id, |d| {
        d.status = DownloadStatus::Paused;
        d.speed_bps = 0;
        d.eta_s = None;
    });
    engine.clear_run(id);
    if let Err(e) = engine.persist_downloads().await {
        tracing::warn!(id = %id, "persist after pause: {e:#}");
    }
    engine.events.publish(Event::DownloadPaused { id: id.to_string() });
    engine.kick();
}

async fn finish_cancelled(engine: &EngineInner, id: &str, single_direct: bool) {
    let scratch = engine.store.scratch_dir(id);
    let _ = tokio::fs::remove_dir_all(&scratch).await;
    if single_direct {
        if let Some(path) = engine.with_download(id, |d| d.final_path()) {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
    engine.with_download(id, |d| {
        d.status = DownloadStatus::Stopped;
        d.speed_bps = 0;
        d.eta_s = None;
    });
    engine.clear_run(id);
    if let Err(e) = engine.persist_downloads().await {
        tracing::warn!(id = %id, "persist after cancel: {e:#}");
    }
    engine.events.publish(Event::DownloadCancelled { id: id.to_string() });
    engine.kick();
}

async fn finish_failed(engine: &EngineInner, id: &str, failure: Option<String>) {
    let error = failure.unwrap_or_else(|| "segment failure".to_string());
    engine.with_download(id, |d| {
        d.status = DownloadStatus::Failed;
        d.last_error = Some(error.clone());
        d.speed_bps = 0;
        d.eta_s = None;
    });
    engine.clear_run(id);
    if let Err(e) = engine.persist_downloads().await {
        tracing::warn!(id = %id, "persist after failure: {e:#}");
    }
    engine.events.publish(Event::DownloadFailed {
        id: id.to_string(),
        error,
    });
    engine.kick();
}

async fn finish_assembled(
    engine: &EngineInner,
    id: &str,
    single_direct: bool,
    stop: &Arc<StdMutex<Option<StopKind>>>,
) {
    let info = engine.with_download(id, |d| {
        d.status = DownloadStatus::Assembling;
        let parts: Vec<(u64, PathBuf)> = d
            .segments
            .iter()
            .map(|s| (s.offset, engine.store.part_path(&d.id, s.id)))
            .collect();
        (parts, d.final_path())
    });
    let Some((parts, final_path)) = info else {
        return;
    };

    let scratch = engine.store.scratch_dir(id);
    let result = if single_direct {
        // The part-file already is the final artifact; only scratch remains.
        let _ = tokio::fs::remove_dir_all(&scratch).await;
        Ok(())
    } else {
        let scratch = scratch.clone();
        let final_path = final_path.clone();
        match tokio::task::spawn_blocking(move || assemble::assemble(parts, &final_path, &scratch))
            .await
        {
            Ok(r) => r,
            Err(e) => Err(anyhow::anyhow!("assemble task: {e}")),
        }
    };

    // A cancel that landed during assembly wins over completion.
    if matches!(*stop.lock().unwrap(), Some(StopKind::Cancel)) {
        let _ = tokio::fs::remove_file(&final_path).await;
        finish_cancelled(engine, id, false).await;
        return;
    }

    match result {
        Ok(()) => {
            engine.with_download(id, |d| {
                d.status = DownloadStatus::Completed;
                d.date_completed = Some(unix_timestamp());
                d.speed_bps = 0;
                d.eta_s = None;
                d.progress_pct = 100.0;
            });
            engine.clear_run(id);
            if engine.evict_from_queues(id) {
                if let Err(e) = engine.persist_queues().await {
                    tracing::warn!(id = %id, "persist queues after completion: {e:#}");
                }
            }
            if let Err(e) = engine.persist_downloads().await {
                tracing::warn!(id = %id, "persist after completion: {e:#}");
            }
            tracing::info!(id = %id, path = %final_path.display(), "download completed");
            engine.events.publish(Event::DownloadCompleted { id: id.to_string() });
            engine.kick();
        }
        Err(e) => {
            // Scratch is preserved; a retry will detect existing bytes.
            tracing::error!(id = %id, "assembly failed: {e:#}");
            finish_failed(engine, id, Some(format!("assemble: {e:#}"))).await;
        }
    }
}
