//! Durable catalog of download and queue records.
//!
//! Two JSON documents under the private data directory, replaced atomically
//! (serialize to a temp file, then rename). Writes are serialized; a failed
//! persist is reported to the caller that requested it and never tears down
//! an active transfer.

pub mod records;

use anyhow::{Context, Result};
use self::records::{Download, Queue};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the private data directory under the download directory.
pub const DATA_DIR_NAME: &str = ".qdm_data";

const DOWNLOADS_FILE: &str = "downloads.json";
const QUEUES_FILE: &str = "queues.json";

#[derive(Debug, Clone)]
pub struct Store {
    data_dir: PathBuf,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Store {
    /// Opens (creating if needed) the data directory under `download_dir`.
    pub fn open(download_dir: &Path) -> Result<Self> {
        let data_dir = download_dir.join(DATA_DIR_NAME);
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data dir {}", data_dir.display()))?;
        Ok(Self {
            data_dir,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Scratch directory holding one download's part-files.
    pub fn scratch_dir(&self, download_id: &str) -> PathBuf {
        self.data_dir.join(download_id)
    }

    pub fn part_path(&self, download_id: &str, segment_id: u32) -> PathBuf {
        self.scratch_dir(download_id).join(format!("{segment_id}.part"))
    }

    pub fn load_downloads(&self) -> Result<Vec<Download>> {
        load_json(&self.data_dir.join(DOWNLOADS_FILE))
    }

    pub fn load_queues(&self) -> Result<Vec<Queue>> {
        load_json(&self.data_dir.join(QUEUES_FILE))
    }

    pub async fn persist_downloads(&self, downloads: &[Download]) -> Result<()> {
        self.persist(DOWNLOADS_FILE, serde_json::to_vec_pretty(downloads)?)
            .await
    }

    pub async fn persist_queues(&self, queues: &[Queue]) -> Result<()> {
        self.persist(QUEUES_FILE, serde_json::to_vec_pretty(queues)?).await
    }

    async fn persist(&self, file_name: &str, bytes: Vec<u8>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.data_dir.join(file_name);
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .context("persist task join")?
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parse {}", path.display()))
}

/// Write-to-temp-then-rename so readers never observe a torn document.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Current time as Unix seconds, for record timestamps.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::records::*;
    use super::*;
    use std::collections::HashMap;

    fn sample_download(id: &str) -> Download {
        Download {
            id: id.to_string(),
            source_url: "https://example.com/file.bin".to_string(),
            request_headers: HashMap::new(),
            file_name: "file.bin".to_string(),
            name_override: None,
            save_dir: PathBuf::from("/tmp"),
            total_size: Some(1000),
            resumable: true,
            status: DownloadStatus::Queued,
            segments: Vec::new(),
            max_segments: 4,
            downloaded: 0,
            progress_pct: 0.0,
            speed_bps: 0,
            eta_s: None,
            date_added: unix_timestamp(),
            date_completed: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn roundtrip_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let records = vec![sample_download("a"), sample_download("b")];
        store.persist_downloads(&records).await.unwrap();

        let loaded = store.load_downloads().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "a");
        assert_eq!(loaded[1].source_url, "https://example.com/file.bin");
    }

    #[tokio::test]
    async fn roundtrip_queues() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mut q = Queue::default_queue(3);
        q.download_ids.push("a".to_string());
        q.schedule = Schedule::from_hhmm("22:00", "02:00", vec![5]);
        store.persist_queues(&[q]).await.unwrap();

        let loaded = store.load_queues().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].download_ids, vec!["a".to_string()]);
        assert_eq!(loaded[0].schedule.as_ref().unwrap().start_minute, 22 * 60);
    }

    #[test]
    fn load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(store.load_downloads().unwrap().is_empty());
        assert!(store.load_queues().unwrap().is_empty());
    }

    #[tokio::test]
    async fn persist_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.persist_downloads(&[sample_download("a")]).await.unwrap();
        let leftovers: Vec<_> = fs::read_dir(store.data_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn part_path_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let p = store.part_path("abc", 2);
        assert!(p.to_string_lossy().ends_with(".qdm_data/abc/2.part"));
    }
}
