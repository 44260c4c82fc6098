//! In-process publish/subscribe for lifecycle and progress events.
//!
//! Fan-out over a bounded broadcast channel; publishers never block and
//! laggards lose old events (acceptable for `download:progress` by design).

use crate::store::records::MediaItem;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum Event {
    DownloadAdded { id: String },
    DownloadStarted { id: String },
    DownloadProgress {
        id: String,
        downloaded: u64,
        total_size: Option<u64>,
        speed_bps: u64,
        eta_s: Option<u64>,
    },
    DownloadPaused { id: String },
    DownloadCompleted { id: String },
    DownloadFailed { id: String, error: String },
    DownloadCancelled { id: String },
    DownloadRemoved { id: String },
    MediaAdded { item: MediaItem },
    MediaUpdated,
    MediaCleared,
    /// A browser agent asked to turn a detected media item into a download.
    MediaDownloadRequested { item: MediaItem },
    QueueCreated { id: String },
    QueueUpdated { id: String },
    QueueDeleted { id: String },
}

impl Event {
    /// Flat topic string for UI-shell routing.
    pub fn topic(&self) -> &'static str {
        match self {
            Event::DownloadAdded { .. } => "download:added",
            Event::DownloadStarted { .. } => "download:started",
            Event::DownloadProgress { .. } => "download:progress",
            Event::DownloadPaused { .. } => "download:paused",
            Event::DownloadCompleted { .. } => "download:completed",
            Event::DownloadFailed { .. } => "download:failed",
            Event::DownloadCancelled { .. } => "download:cancelled",
            Event::DownloadRemoved { .. } => "download:removed",
            Event::MediaAdded { .. } => "media:added",
            Event::MediaUpdated => "media:updated",
            Event::MediaCleared => "media:cleared",
            Event::MediaDownloadRequested { .. } => "media:download",
            Event::QueueCreated { .. } => "queue:created",
            Event::QueueUpdated { .. } => "queue:updated",
            Event::QueueDeleted { .. } => "queue:deleted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publishes without blocking; a send with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
