//! Download engine: registry of download records, lifecycle commands, and
//! queue membership. Each active download is driven by its own supervisor
//! task; the engine owns the records and hands supervisors a cancellation
//! handle per run.

mod supervisor;

use crate::config::{QdmConfig, MAX_SEGMENTS_LIMIT};
use crate::events::{Event, EventBus};
use crate::ratelimit::RateLimiter;
use crate::scheduler;
use crate::store::records::{
    Download, DownloadStatus, Queue, Schedule, SegmentState, DEFAULT_QUEUE_ID,
};
use crate::store::{unix_timestamp, Store};
use crate::naming;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::Notify;

/// Request to create a new download.
#[derive(Debug, Clone, Default)]
pub struct AddRequest {
    pub url: String,
    /// Caller headers, forwarded (minus hygiene strips) on every request.
    pub headers: HashMap<String, String>,
    /// Caller override for the final file name.
    pub file_name: Option<String>,
    /// Defaults to the configured download directory.
    pub save_dir: Option<PathBuf>,
    /// Defaults to the configured per-download segment cap.
    pub max_segments: Option<u32>,
    /// Defaults to the default queue.
    pub queue_id: Option<String>,
    /// Kick the scheduler right away so the download starts if a slot is free.
    pub autostart: bool,
}

/// How a signalled run should end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopKind {
    Pause,
    Cancel,
}

/// Cancellation handle for one supervisor run.
pub(crate) struct RunHandle {
    pub(crate) abort: Arc<AtomicBool>,
    pub(crate) stop: Arc<StdMutex<Option<StopKind>>>,
}

pub(crate) struct Managed {
    pub(crate) record: Download,
    pub(crate) run: Option<RunHandle>,
}

pub(crate) struct EngineInner {
    pub(crate) cfg: QdmConfig,
    pub(crate) store: Store,
    pub(crate) events: EventBus,
    pub(crate) limiter: RateLimiter,
    pub(crate) downloads: RwLock<HashMap<String, Managed>>,
    pub(crate) queues: StdMutex<Vec<Queue>>,
    pub(crate) sched_kick: Notify,
    /// Admission passes are serialized; overlapping sweeps could admit past a
    /// queue's concurrency cap.
    pub(crate) sweep_lock: tokio::sync::Mutex<()>,
}

/// Handle to the engine; cheap to clone.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    /// Opens the store under the configured download directory, loads records,
    /// and applies crash recovery: anything found mid-transfer is rewritten to
    /// `paused` — part-files on disk are the source of truth for resume.
    pub async fn new(cfg: QdmConfig) -> Result<Self> {
        let cfg = cfg.normalized();
        let store = Store::open(&cfg.download_dir)?;

        let mut recovered = 0usize;
        let mut downloads = HashMap::new();
        for mut record in store.load_downloads()? {
            if record.status.is_active() {
                record.status = DownloadStatus::Paused;
                record.speed_bps = 0;
                record.eta_s = None;
                for seg in &mut record.segments {
                    if seg.state == SegmentState::Running {
                        seg.state = SegmentState::NotStarted;
                    }
                }
                recovered += 1;
            }
            downloads.insert(record.id.clone(), Managed { record, run: None });
        }
        if recovered > 0 {
            tracing::info!("recovered {} download(s) from previous run", recovered);
        }

        let mut queues = store.load_queues()?;
        if !queues.iter().any(|q| q.id == DEFAULT_QUEUE_ID) {
            queues.insert(0, Queue::default_queue(cfg.max_concurrent_downloads));
        }
        for q in &mut queues {
            q.download_ids.retain(|id| downloads.contains_key(id));
        }

        let limiter = RateLimiter::new(cfg.speed_limit_kbps);
        let engine = Engine {
            inner: Arc::new(EngineInner {
                cfg,
                store,
                events: EventBus::new(),
                limiter,
                downloads: RwLock::new(downloads),
                queues: StdMutex::new(queues),
                sched_kick: Notify::new(),
                sweep_lock: tokio::sync::Mutex::new(()),
            }),
        };

        engine.inner.persist_downloads().await?;
        engine.inner.persist_queues().await?;
        Ok(engine)
    }

    pub fn config(&self) -> &QdmConfig {
        &self.inner.cfg
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Download> {
        self.inner.snapshot(id)
    }

    pub fn list(&self) -> Vec<Download> {
        self.inner.downloads_snapshot()
    }

    pub fn queues(&self) -> Vec<Queue> {
        self.inner.queues.lock().unwrap().clone()
    }

    /// Runs one scheduler admission pass inline.
    pub async fn sweep_now(&self) -> Result<()> {
        scheduler::sweep(self).await
    }

    /// Creates a download record, persists it, and places it in a queue.
    pub async fn add(&self, req: AddRequest) -> Result<String> {
        let parsed = url::Url::parse(&req.url).context("invalid URL")?;
        match parsed.scheme() {
            "http" | "https" => {}
            s => bail!("unsupported URL scheme: {s}"),
        }

        let queue_id = req.queue_id.unwrap_or_else(|| DEFAULT_QUEUE_ID.to_string());
        if !self.inner.queues.lock().unwrap().iter().any(|q| q.id == queue_id) {
            bail!("unknown queue: {queue_id}");
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let name_override = req
            .file_name
            .as_deref()
            .map(naming::sanitize_file_name)
            .filter(|s| !s.is_empty());
        let file_name = naming::derive_file_name(
            name_override.as_deref(),
            None,
            &req.url,
            None,
            &id,
        );

        let record = Download {
            id: id.clone(),
            source_url: req.url,
            request_headers: req.headers,
            file_name,
            name_override,
            save_dir: req
                .save_dir
                .unwrap_or_else(|| self.inner.cfg.download_dir.clone()),
            total_size: None,
            resumable: false,
            status: DownloadStatus::Queued,
            segments: Vec::new(),
            max_segments: req
                .max_segments
                .unwrap_or(self.inner.cfg.max_segments_per_download)
                .clamp(1, MAX_SEGMENTS_LIMIT),
            downloaded: 0,
            progress_pct: 0.0,
            speed_bps: 0,
            eta_s: None,
            date_added: unix_timestamp(),
            date_completed: None,
            last_error: None,
        };

        self.inner
            .downloads
            .write()
            .unwrap()
            .insert(id.clone(), Managed { record, run: None });
        {
            let mut queues = self.inner.queues.lock().unwrap();
            for q in queues.iter_mut() {
                q.download_ids.retain(|d| d != &id);
            }
            if let Some(q) = queues.iter_mut().find(|q| q.id == queue_id) {
                q.download_ids.push(id.clone());
            }
        }

        self.inner.events.publish(Event::DownloadAdded { id: id.clone() });
        self.inner.persist_downloads().await?;
        self.inner.persist_queues().await?;

        if req.autostart {
            if let Err(e) = self.sweep_now().await {
                tracing::warn!("autostart sweep: {e:#}");
            }
        } else {
            // The background scheduler picks queued work up on its next pass.
            self.inner.kick();
        }
        Ok(id)
    }

    /// Transitions a download to `downloading` and spawns its supervisor.
    pub(crate) async fn start(&self, id: &str) -> Result<()> {
        let (abort, stop) = {
            let mut map = self.inner.downloads.write().unwrap();
            let m = map.get_mut(id).with_context(|| format!("unknown download {id}"))?;
            if m.run.is_some() {
                bail!("busy: download {id} already has an active run");
            }
            match m.record.status {
                DownloadStatus::Queued | DownloadStatus::Paused | DownloadStatus::Failed => {}
                other => bail!("cannot start download in state {other:?}"),
            }
            m.record.status = DownloadStatus::Downloading;
            m.record.last_error = None;
            m.record.speed_bps = 0;
            let abort = Arc::new(AtomicBool::new(false));
            let stop = Arc::new(StdMutex::new(None));
            m.run = Some(RunHandle {
                abort: Arc::clone(&abort),
                stop: Arc::clone(&stop),
            });
            (abort, stop)
        };

        self.inner.events.publish(Event::DownloadStarted { id: id.to_string() });
        tokio::spawn(supervisor::run(
            Arc::clone(&self.inner),
            id.to_string(),
            abort,
            stop,
        ));
        if let Err(e) = self.inner.persist_downloads().await {
            tracing::warn!("persist after start: {e:#}");
        }
        Ok(())
    }

    /// Signals every worker of a running download to stop; part-files are kept.
    /// The transition to `paused` completes once all workers have returned.
    pub async fn pause(&self, id: &str) -> Result<()> {
        let map = self.inner.downloads.read().unwrap();
        let m = map.get(id).with_context(|| format!("unknown download {id}"))?;
        if m.record.status != DownloadStatus::Downloading {
            bail!("download {id} is not downloading");
        }
        let run = m.run.as_ref().context("download has no active run")?;
        let mut stop = run.stop.lock().unwrap();
        if stop.is_some() {
            bail!("busy: teardown already in flight for {id}");
        }
        *stop = Some(StopKind::Pause);
        run.abort.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Re-enters `start` for a paused download. Failed segments are reset to
    /// `not_started`; their byte counters are kept for range resume.
    pub async fn resume(&self, id: &str) -> Result<()> {
        {
            let mut map = self.inner.downloads.write().unwrap();
            let m = map.get_mut(id).with_context(|| format!("unknown download {id}"))?;
            if m.record.status != DownloadStatus::Paused {
                bail!("download {id} is not paused");
            }
            if m.run.is_some() {
                bail!("busy: teardown still in flight for {id}");
            }
            for seg in &mut m.record.segments {
                if seg.state == SegmentState::Failed {
                    seg.state = SegmentState::NotStarted;
                }
            }
        }
        self.start(id).await
    }

    /// Restarts a failed download: every non-finished segment is reset to
    /// `not_started` with a zeroed counter.
    pub async fn retry(&self, id: &str) -> Result<()> {
        {
            let mut map = self.inner.downloads.write().unwrap();
            let m = map.get_mut(id).with_context(|| format!("unknown download {id}"))?;
            if m.record.status != DownloadStatus::Failed {
                bail!("download {id} is not failed");
            }
            if m.run.is_some() {
                bail!("busy: teardown still in flight for {id}");
            }
            for seg in &mut m.record.segments {
                if !seg.is_finished() {
                    seg.state = SegmentState::NotStarted;
                    seg.downloaded = 0;
                }
            }
            m.record.downloaded = m.record.segment_sum();
            m.record.last_error = None;
        }
        self.start(id).await
    }

    /// Stops a download and deletes its scratch directory.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let immediate = {
            let map = self.inner.downloads.read().unwrap();
            let m = map.get(id).with_context(|| format!("unknown download {id}"))?;
            match m.record.status {
                DownloadStatus::Downloading | DownloadStatus::Assembling => {
                    let run = m.run.as_ref().context("download has no active run")?;
                    let mut stop = run.stop.lock().unwrap();
                    if stop.is_some() {
                        bail!("busy: teardown already in flight for {id}");
                    }
                    *stop = Some(StopKind::Cancel);
                    run.abort.store(true, Ordering::Relaxed);
                    false
                }
                DownloadStatus::Queued | DownloadStatus::Paused | DownloadStatus::Failed => true,
                other => bail!("cannot cancel download in state {other:?}"),
            }
        };

        if immediate {
            let scratch = self.inner.store.scratch_dir(id);
            let _ = tokio::fs::remove_dir_all(&scratch).await;
            self.inner.with_download(id, |d| {
                d.status = DownloadStatus::Stopped;
                d.speed_bps = 0;
                d.eta_s = None;
            });
            self.inner.events.publish(Event::DownloadCancelled { id: id.to_string() });
            self.inner.persist_downloads().await?;
            self.inner.kick();
        }
        Ok(())
    }

    /// Destroys a finished download record and its remaining scratch files.
    pub async fn remove(&self, id: &str) -> Result<()> {
        {
            let mut map = self.inner.downloads.write().unwrap();
            let m = map.get(id).with_context(|| format!("unknown download {id}"))?;
            match m.record.status {
                DownloadStatus::Stopped | DownloadStatus::Failed | DownloadStatus::Completed => {}
                other => bail!("cannot remove download in state {other:?}"),
            }
            map.remove(id);
        }
        self.inner.evict_from_queues(id);
        let _ = tokio::fs::remove_dir_all(self.inner.store.scratch_dir(id)).await;

        self.inner.events.publish(Event::DownloadRemoved { id: id.to_string() });
        self.inner.persist_downloads().await?;
        self.inner.persist_queues().await?;
        self.inner.kick();
        Ok(())
    }

    pub async fn create_queue(
        &self,
        name: &str,
        max_concurrent: usize,
        schedule: Option<Schedule>,
    ) -> Result<String> {
        if name.trim().is_empty() {
            bail!("queue name must not be empty");
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.inner.queues.lock().unwrap().push(Queue {
            id: id.clone(),
            name: name.trim().to_string(),
            enabled: true,
            max_concurrent: max_concurrent.max(1),
            download_ids: Vec::new(),
            schedule,
        });
        self.inner.events.publish(Event::QueueCreated { id: id.clone() });
        self.inner.persist_queues().await?;
        Ok(id)
    }

    /// Deletes a queue; refused for the sole remaining queue. Members are
    /// appended to the first remaining queue so no download is orphaned.
    pub async fn delete_queue(&self, id: &str) -> Result<()> {
        {
            let mut queues = self.inner.queues.lock().unwrap();
            if queues.len() <= 1 {
                bail!("cannot delete the last remaining queue");
            }
            let pos = queues
                .iter()
                .position(|q| q.id == id)
                .with_context(|| format!("unknown queue {id}"))?;
            let removed = queues.remove(pos);
            if let Some(first) = queues.first_mut() {
                first.download_ids.extend(removed.download_ids);
            }
        }
        self.inner.events.publish(Event::QueueDeleted { id: id.to_string() });
        self.inner.persist_queues().await?;
        self.inner.kick();
        Ok(())
    }

    /// Updates a queue's settings; membership is managed via [`Engine::move_to_queue`].
    pub async fn update_queue(&self, update: Queue) -> Result<()> {
        {
            let mut queues = self.inner.queues.lock().unwrap();
            let q = queues
                .iter_mut()
                .find(|q| q.id == update.id)
                .with_context(|| format!("unknown queue {}", update.id))?;
            q.name = update.name;
            q.enabled = update.enabled;
            q.max_concurrent = update.max_concurrent.max(1);
            q.schedule = update.schedule;
        }
        self.inner.events.publish(Event::QueueUpdated { id: update.id.clone() });
        self.inner.persist_queues().await?;
        self.inner.kick();
        Ok(())
    }

    /// Moves a download between queues atomically: removed from every queue,
    /// appended to the target, persisted once.
    pub async fn move_to_queue(&self, download_id: &str, queue_id: &str) -> Result<()> {
        {
            let mut queues = self.inner.queues.lock().unwrap();
            if !queues.iter().any(|q| q.id == queue_id) {
                bail!("unknown queue {queue_id}");
            }
            for q in queues.iter_mut() {
                q.download_ids.retain(|d| d != download_id);
            }
            if let Some(q) = queues.iter_mut().find(|q| q.id == queue_id) {
                q.download_ids.push(download_id.to_string());
            }
        }
        self.inner.events.publish(Event::QueueUpdated { id: queue_id.to_string() });
        self.inner.persist_queues().await?;
        self.inner.kick();
        Ok(())
    }
}

impl EngineInner {
    pub(crate) fn with_download<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Download) -> R,
    ) -> Option<R> {
        let mut map = self.downloads.write().unwrap();
        map.get_mut(id).map(|m| f(&mut m.record))
    }

    pub(crate) fn snapshot(&self, id: &str) -> Option<Download> {
        self.downloads.read().unwrap().get(id).map(|m| m.record.clone())
    }

    pub(crate) fn downloads_snapshot(&self) -> Vec<Download> {
        let map = self.downloads.read().unwrap();
        let mut out: Vec<Download> = map.values().map(|m| m.record.clone()).collect();
        out.sort_by(|a, b| a.date_added.cmp(&b.date_added).then(a.id.cmp(&b.id)));
        out
    }

    pub(crate) async fn persist_downloads(&self) -> Result<()> {
        let snapshot = self.downloads_snapshot();
        self.store.persist_downloads(&snapshot).await
    }

    pub(crate) async fn persist_queues(&self) -> Result<()> {
        let snapshot = self.queues.lock().unwrap().clone();
        self.store.persist_queues(&snapshot).await
    }

    pub(crate) fn clear_run(&self, id: &str) {
        if let Some(m) = self.downloads.write().unwrap().get_mut(id) {
            m.run = None;
        }
    }

    pub(crate) fn evict_from_queues(&self, id: &str) -> bool {
        let mut queues = self.queues.lock().unwrap();
        let mut changed = false;
        for q in queues.iter_mut() {
            let before = q.download_ids.len();
            q.download_ids.retain(|d| d != id);
            changed |= q.download_ids.len() != before;
        }
        changed
    }

    /// Wakes the scheduler for an extra admission pass.
    pub(crate) fn kick(&self) {
        self.sched_kick.notify_one();
    }
}
