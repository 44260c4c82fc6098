//! Detected-media list: classification, YouTube URL normalization, dedup.

use super::protocol::IngestMessage;
use crate::naming;
use crate::store::records::{MediaItem, MediaKind};
use crate::store::unix_timestamp;
use std::sync::Mutex;
use url::Url;

/// Query parameters YouTube uses for per-request byte windows; stripped so
/// chunked reports of the same stream collapse to one canonical URL.
const YOUTUBE_RANGE_PARAMS: &[&str] = &["range", "rn", "rbuf"];

/// In-memory list of candidate media URLs, owned by the ingestion endpoint.
/// External readers take snapshots.
#[derive(Debug, Default)]
pub struct MediaStore {
    items: Mutex<Vec<MediaItem>>,
}

impl MediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts unless an item with the same canonical URL exists.
    /// Returns the inserted item, or `None` on dedup.
    pub fn insert(&self, item: MediaItem) -> Option<MediaItem> {
        let mut items = self.items.lock().unwrap();
        if items.iter().any(|existing| existing.url == item.url) {
            return None;
        }
        items.push(item.clone());
        Some(item)
    }

    pub fn get(&self, id: &str) -> Option<MediaItem> {
        self.items.lock().unwrap().iter().find(|i| i.id == id).cloned()
    }

    pub fn list(&self) -> Vec<MediaItem> {
        self.items.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.items.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renames every item whose `source_tab_url` matches, preserving the
    /// original extension. Returns how many items changed.
    pub fn rename_tab(&self, tab_url: &str, title: &str) -> usize {
        let title = naming::sanitize_file_name(title);
        if title.is_empty() {
            return 0;
        }
        let mut items = self.items.lock().unwrap();
        let mut changed = 0;
        for item in items.iter_mut() {
            if item.source_tab_url.as_deref() == Some(tab_url) {
                item.name = match item.name.rsplit_once('.') {
                    Some((_, ext)) if !ext.is_empty() => format!("{title}.{ext}"),
                    _ => title.clone(),
                };
                changed += 1;
            }
        }
        changed
    }
}

/// True for the hosts whose URLs carry per-request range parameters.
pub fn is_youtube_url(url: &Url) -> bool {
    url.host_str()
        .map(|h| h.contains("googlevideo.com") || h.contains("youtube.com"))
        .unwrap_or(false)
}

/// Canonical form used as the dedup key and as the download URL: for YouTube
/// hosts the `range`, `rn`, and `rbuf` query parameters are stripped.
pub fn canonical_media_url(raw: &str) -> String {
    let Ok(parsed) = Url::parse(raw) else {
        return raw.to_string();
    };
    if !is_youtube_url(&parsed) {
        return raw.to_string();
    }
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !YOUTUBE_RANGE_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut canonical = parsed;
    canonical.set_query(None);
    if !kept.is_empty() {
        canonical.query_pairs_mut().extend_pairs(kept);
    }
    canonical.into()
}

/// Classifies a reported media URL.
pub fn classify(msg: &IngestMessage, url: &Url) -> MediaKind {
    let content_type = msg.content_type.as_deref().unwrap_or("").to_ascii_lowercase();
    let path = url.path().to_ascii_lowercase();

    if content_type.contains("mpegurl") || path.ends_with(".m3u8") {
        return MediaKind::Hls;
    }
    if content_type.contains("dash+xml") || path.ends_with(".mpd") {
        return MediaKind::Dash;
    }
    let tab_is_youtube = msg
        .tab_url
        .as_deref()
        .and_then(|t| Url::parse(t).ok())
        .map(|t| is_youtube_url(&t))
        .unwrap_or(false);
    if is_youtube_url(url) || tab_is_youtube {
        return MediaKind::Youtube;
    }
    if content_type.starts_with("audio") {
        return MediaKind::Audio;
    }
    MediaKind::Video
}

/// Builds a [`MediaItem`] from an agent report. `None` for unparseable URLs.
pub fn item_from_message(msg: &IngestMessage) -> Option<MediaItem> {
    let parsed = Url::parse(&msg.url).ok()?;
    let canonical = canonical_media_url(&msg.url);
    let kind = classify(msg, &parsed);

    let mut name = msg
        .file
        .clone()
        .or_else(|| naming::file_name_from_url(&canonical))
        .or_else(|| msg.tab_title.clone())
        .map(|n| naming::sanitize_file_name(&n))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "media".to_string());
    if !name.contains('.') {
        if let Some(ext) =
            naming::extension_for_content_type(msg.content_type.as_deref().unwrap_or(""))
        {
            name.push('.');
            name.push_str(ext);
        }
    }

    let description = msg
        .quality
        .clone()
        .or_else(|| msg.content_type.clone())
        .unwrap_or_default();

    Some(MediaItem {
        id: uuid::Uuid::new_v4().simple().to_string(),
        name,
        description,
        source_tab_url: msg.tab_url.clone(),
        url: canonical,
        kind,
        content_type: msg.content_type.clone(),
        size: msg.content_length,
        headers: msg.request_headers.clone().unwrap_or_default(),
        cookies: msg.cookie.clone(),
        tab_id: msg.tab_id,
        date_added: unix_timestamp(),
    })
}
