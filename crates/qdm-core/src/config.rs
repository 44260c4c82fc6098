//! Global configuration loaded from `~/.config/qdm/config.toml`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Hard ceiling on segments per download.
pub const MAX_SEGMENTS_LIMIT: u32 = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QdmConfig {
    /// Default directory for final artifacts; the private data directory
    /// (`.qdm_data/`) lives underneath it.
    pub download_dir: PathBuf,
    /// Concurrency cap of the default queue.
    pub max_concurrent_downloads: usize,
    /// Upper bound on segment count per download, clamped to `[1, 32]`.
    pub max_segments_per_download: u32,
    /// Process-wide byte-rate ceiling in KiB/s; 0 = unlimited.
    pub speed_limit_kbps: u64,
    /// Port of the loopback ingestion endpoint; auto-bumped on conflict.
    pub ingestion_port: u16,
    /// UI hints, opaque to the core.
    pub show_notifications: bool,
    pub minimize_to_tray: bool,
    pub capture: CaptureConfig,
}

/// Filters applied to URLs posted by browser agents, and the lists echoed
/// back in the sync snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub enabled: bool,
    /// Extensions captured by `/download` and `/link`.
    pub file_exts: Vec<String>,
    /// Hosts never captured (suffix match).
    pub blocked_hosts: Vec<String>,
    /// Extensions the agent should intercept at the request layer.
    pub request_file_exts: Vec<String>,
    /// Content-type prefixes treated as media by the agent.
    pub media_types: Vec<String>,
    /// Tab host patterns the agent watches for media.
    pub tabs_watcher: Vec<String>,
    /// Hosts the agent always hands over.
    pub matching_hosts: Vec<String>,
}

impl Default for QdmConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            max_concurrent_downloads: 3,
            max_segments_per_download: 8,
            speed_limit_kbps: 0,
            ingestion_port: 8597,
            show_notifications: true,
            minimize_to_tray: false,
            capture: CaptureConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file_exts: [
                "zip", "rar", "7z", "tar", "gz", "iso", "exe", "msi", "deb", "rpm", "dmg",
                "apk", "pdf", "mp3", "mp4", "mkv", "webm", "avi", "flac", "epub",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            blocked_hosts: Vec::new(),
            request_file_exts: ["m3u8", "mpd"].iter().map(|s| s.to_string()).collect(),
            media_types: ["video/", "audio/", "application/vnd.apple.mpegurl", "application/dash+xml"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            tabs_watcher: ["youtube.com", "vimeo.com", "dailymotion.com"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            matching_hosts: Vec::new(),
        }
    }
}

impl QdmConfig {
    /// Clamps out-of-range values instead of failing.
    pub fn normalized(mut self) -> Self {
        self.max_concurrent_downloads = self.max_concurrent_downloads.max(1);
        self.max_segments_per_download = self.max_segments_per_download.clamp(1, MAX_SEGMENTS_LIMIT);
        self
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("qdm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<QdmConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = QdmConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: QdmConfig = toml::from_str(&data)?;
    Ok(cfg.normalized())
}
