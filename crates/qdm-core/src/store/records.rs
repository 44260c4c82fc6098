//! Persisted record types: downloads, segments, queues, detected media.

use crate::naming;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Lifecycle state of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Assembling,
    Completed,
    Failed,
    Stopped,
}

impl DownloadStatus {
    /// True while the download occupies a concurrency slot in its queue.
    pub fn is_active(self) -> bool {
        matches!(self, DownloadStatus::Downloading | DownloadStatus::Assembling)
    }
}

/// State of a single byte-range segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    NotStarted,
    Running,
    Finished,
    Failed,
}

/// One contiguous byte-range of a download, backed by its own part-file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: u32,
    /// Absolute start byte in the final file.
    pub offset: u64,
    /// Byte count; `None` only for single-segment non-resumable downloads.
    pub length: Option<u64>,
    /// Bytes written to this segment's part-file so far.
    pub downloaded: u64,
    pub state: SegmentState,
}

impl Segment {
    pub fn is_finished(&self) -> bool {
        self.state == SegmentState::Finished
    }

    /// Leaf name of the part-file inside the download's scratch directory.
    pub fn part_file_name(&self) -> String {
        format!("{}.part", self.id)
    }
}

/// One remote artifact being fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    pub id: String,
    /// URL as supplied; rewritten to the post-redirect URL on supervisor start.
    pub source_url: String,
    /// Caller-supplied headers, passed through (minus hygiene strips) on every request.
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    /// On-disk leaf name of the final artifact.
    pub file_name: String,
    /// Caller override for the file name; wins over any derived name.
    #[serde(default)]
    pub name_override: Option<String>,
    pub save_dir: PathBuf,
    /// `None` = unknown size.
    pub total_size: Option<u64>,
    pub resumable: bool,
    pub status: DownloadStatus,
    #[serde(default)]
    pub segments: Vec<Segment>,
    pub max_segments: u32,
    /// Must equal the sum of segment counters at rest.
    pub downloaded: u64,
    pub progress_pct: f64,
    pub speed_bps: u64,
    pub eta_s: Option<u64>,
    pub date_added: i64,
    pub date_completed: Option<i64>,
    pub last_error: Option<String>,
}

impl Download {
    /// Full path of the final artifact.
    pub fn final_path(&self) -> PathBuf {
        self.save_dir.join(&self.file_name)
    }

    /// Presentational category derived from the file extension.
    pub fn category(&self) -> naming::Category {
        naming::category_for(&self.file_name)
    }

    pub fn segment_sum(&self) -> u64 {
        self.segments.iter().map(|s| s.downloaded).sum()
    }

    pub(crate) fn recompute_progress(&mut self) {
        self.progress_pct = match self.total_size {
            Some(total) if total > 0 => (self.downloaded as f64 / total as f64) * 100.0,
            Some(_) => 100.0,
            None => 0.0,
        };
        self.eta_s = match (self.total_size, self.speed_bps) {
            (Some(total), speed) if speed > 0 && total > self.downloaded => {
                Some((total - self.downloaded) / speed)
            }
            _ => None,
        };
    }
}

/// Weekly admission window for a queue. Wraps past midnight when `end < start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Minute-of-day the window opens (0..1440).
    pub start_minute: u16,
    /// Minute-of-day the window closes, inclusive.
    pub end_minute: u16,
    /// Weekdays the window applies to; 0 = Sunday .. 6 = Saturday.
    pub days: Vec<u8>,
}

impl Schedule {
    /// Builds a schedule from "HH:MM" bounds. Returns `None` on malformed input.
    pub fn from_hhmm(start: &str, end: &str, days: Vec<u8>) -> Option<Self> {
        Some(Schedule {
            start_minute: parse_hhmm(start)?,
            end_minute: parse_hhmm(end)?,
            days,
        })
    }
}

fn parse_hhmm(s: &str) -> Option<u16> {
    let (h, m) = s.split_once(':')?;
    let h: u16 = h.trim().parse().ok()?;
    let m: u16 = m.trim().parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// An ordered set of downloads sharing a concurrency cap and optional window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub max_concurrent: usize,
    /// Member download ids; order = admission order.
    #[serde(default)]
    pub download_ids: Vec<String>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
}

/// Id of the queue that always exists.
pub const DEFAULT_QUEUE_ID: &str = "default";

impl Queue {
    pub fn default_queue(max_concurrent: usize) -> Self {
        Queue {
            id: DEFAULT_QUEUE_ID.to_string(),
            name: "Default".to_string(),
            enabled: true,
            max_concurrent: max_concurrent.max(1),
            download_ids: Vec::new(),
            schedule: None,
        }
    }
}

/// Classification of a detected media URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
    Hls,
    Dash,
    Youtube,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Hls => "hls",
            MediaKind::Dash => "dash",
            MediaKind::Youtube => "youtube",
        }
    }
}

/// A URL reported by a browser agent as a candidate download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub name: String,
    pub description: String,
    pub source_tab_url: Option<String>,
    /// Canonical URL (YouTube range parameters stripped); also the dedup key.
    pub url: String,
    pub kind: MediaKind,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub cookies: Option<String>,
    pub tab_id: Option<i64>,
    pub date_added: i64,
}
