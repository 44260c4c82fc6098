//! Wire types for the browser-agent protocol. Field names are camelCase on
//! the wire; unknown fields are ignored so agent versions can drift.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A message posted by a browser agent: an intercepted download, a detected
/// media stream, or one of the small control bodies (`vid`, tab updates).
/// Every field except `url` is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestMessage {
    pub url: String,
    /// Suggested file name.
    pub file: Option<String>,
    pub method: Option<String>,
    pub request_headers: Option<HashMap<String, String>>,
    pub response_headers: Option<HashMap<String, String>>,
    pub cookie: Option<String>,
    pub tab_url: Option<String>,
    pub tab_title: Option<String>,
    pub tab_id: Option<i64>,
    /// Media item id, for `/vid`.
    pub vid: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub quality: Option<String>,
}

/// Snapshot returned on every exchange so agents learn config changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub enabled: bool,
    pub file_exts: Vec<String>,
    pub blocked_hosts: Vec<String>,
    pub request_file_exts: Vec<String>,
    pub media_types: Vec<String>,
    pub tabs_watcher: Vec<String>,
    pub matching_hosts: Vec<String>,
    pub video_list: Vec<VideoEntry>,
}

/// One detected media item as rendered by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoEntry {
    pub id: String,
    pub text: String,
    pub info: String,
    pub tab_id: Option<i64>,
    pub size: Option<u64>,
    #[serde(rename = "type")]
    pub kind: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_parses_camel_case() {
        let json = r#"{
            "url": "http://host/f.zip",
            "file": "f.zip",
            "tabUrl": "https://site.example/page",
            "contentLength": 1234,
            "requestHeaders": {"Referer": "https://site.example/"}
        }"#;
        let msg: IngestMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.url, "http://host/f.zip");
        assert_eq!(msg.tab_url.as_deref(), Some("https://site.example/page"));
        assert_eq!(msg.content_length, Some(1234));
        assert_eq!(
            msg.request_headers.unwrap().get("Referer").map(String::as_str),
            Some("https://site.example/")
        );
    }

    #[test]
    fn message_tolerates_unknown_fields_and_omissions() {
        let msg: IngestMessage = serde_json::from_str(r#"{"url":"x","futureField":1}"#).unwrap();
        assert_eq!(msg.url, "x");
        assert!(msg.file.is_none());
    }

    #[test]
    fn video_entry_type_key() {
        let entry = VideoEntry {
            id: "a".into(),
            text: "clip.mp4".into(),
            info: "1080p".into(),
            tab_id: Some(7),
            size: None,
            kind: "video".into(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"video\""));
        assert!(json.contains("\"tabId\":7"));
    }
}
