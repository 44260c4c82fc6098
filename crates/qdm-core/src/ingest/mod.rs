//! Loopback ingestion endpoint for browser agents.
//!
//! A plain HTTP/1.1 listener on 127.0.0.1. CORS is wide open because requests
//! originate from arbitrary browser origins; responses are non-cacheable and
//! every successful exchange returns the sync snapshot so agents pick up
//! config changes. Endpoint errors never disturb in-flight downloads.

pub mod media;
pub mod protocol;

use crate::engine::{AddRequest, Engine};
use crate::events::Event;
use crate::config::CaptureConfig;
use crate::naming;
use anyhow::{bail, Context, Result};
use self::media::MediaStore;
use self::protocol::{IngestMessage, SyncSnapshot, VideoEntry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

/// Ports tried past the configured one when the bind races another process.
const PORT_PROBE_LIMIT: u16 = 16;
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REQUEST_BYTES: usize = 1 << 20;

/// Running endpoint; dropping the handle does not stop it, abort it instead.
pub struct IngestServer {
    pub port: u16,
    pub handle: tokio::task::JoinHandle<()>,
}

/// Binds the loopback listener (bumping the port on address-in-use) and
/// spawns the accept loop.
pub async fn spawn(engine: Engine, media: Arc<MediaStore>) -> Result<IngestServer> {
    let base = engine.config().ingestion_port;
    let (listener, port) = bind_with_fallback(base).await?;
    tracing::info!(port, "ingestion endpoint listening on 127.0.0.1");

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let engine = engine.clone();
                    let media = Arc::clone(&media);
                    tokio::spawn(serve_conn(stream, engine, media));
                }
                Err(e) => tracing::debug!("ingest accept: {e}"),
            }
        }
    });
    Ok(IngestServer { port, handle })
}

async fn bind_with_fallback(base: u16) -> Result<(TcpListener, u16)> {
    for offset in 0..PORT_PROBE_LIMIT {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                return Ok((listener, bound));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "ingestion port in use, trying next");
            }
            Err(e) => return Err(e).with_context(|| format!("bind 127.0.0.1:{port}")),
        }
    }
    bail!("no free ingestion port in {base}..{}", base.saturating_add(PORT_PROBE_LIMIT))
}

async fn serve_conn(stream: TcpStream, engine: Engine, media: Arc<MediaStore>) {
    match tokio::time::timeout(READ_TIMEOUT, handle_exchange(stream, engine, media)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("ingest connection: {e:#}"),
        Err(_) => tracing::debug!("ingest connection timed out"),
    }
}

async fn handle_exchange(
    mut stream: TcpStream,
    engine: Engine,
    media: Arc<MediaStore>,
) -> Result<()> {
    let (method, path, body) = read_request(&mut stream).await?;

    // Handlers run on their own task so a panic answers 500 instead of
    // silently dropping the connection.
    let routed = tokio::spawn(route(method, path, body, engine, media)).await;
    let (status, body) = match routed {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("ingest handler panicked: {e}");
            (500, r#"{"error":"internal"}"#.to_string())
        }
    };
    write_response(&mut stream, status, &body).await
}

async fn read_request(stream: &mut TcpStream) -> Result<(String, String, Vec<u8>)> {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 8192];
    let header_end = loop {
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > MAX_REQUEST_BYTES {
            bail!("request head too large");
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            bail!("connection closed before request head");
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.lines();
    let request_line = lines.next().context("empty request")?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().context("missing method")?.to_ascii_uppercase();
    let target = parts.next().context("missing request target")?;
    let path = target.split('?').next().unwrap_or(target).to_string();

    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    if content_length > MAX_REQUEST_BYTES {
        bail!("request body too large");
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(content_length);
    Ok((method, path, body))
}

async fn write_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    let reason = match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: *\r\n\
         Cache-Control: no-store\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn route(
    method: String,
    path: String,
    body: Vec<u8>,
    engine: Engine,
    media: Arc<MediaStore>,
) -> (u16, String) {
    if method == "OPTIONS" {
        return (204, String::new());
    }

    let bad_request = |e: serde_json::Error| (400, format!(r#"{{"error":"{e}"}}"#));

    match (method.as_str(), path.as_str()) {
        ("GET", "/sync") => sync_response(&engine, &media),
        ("POST", "/download") => match serde_json::from_slice::<IngestMessage>(&body) {
            Ok(msg) => {
                capture(&engine, msg, true).await;
                sync_response(&engine, &media)
            }
            Err(e) => bad_request(e),
        },
        ("POST", "/link") => match serde_json::from_slice::<Vec<IngestMessage>>(&body) {
            Ok(messages) => {
                for msg in messages {
                    capture(&engine, msg, false).await;
                }
                sync_response(&engine, &media)
            }
            Err(e) => bad_request(e),
        },
        ("POST", "/media") => match serde_json::from_slice::<IngestMessage>(&body) {
            Ok(msg) => {
                if let Some(item) = media::item_from_message(&msg) {
                    if let Some(inserted) = media.insert(item) {
                        engine.events().publish(Event::MediaAdded { item: inserted });
                    }
                } else {
                    tracing::debug!("media report with unparseable url ignored");
                }
                sync_response(&engine, &media)
            }
            Err(e) => bad_request(e),
        },
        ("POST", "/vid") => match serde_json::from_slice::<IngestMessage>(&body) {
            Ok(msg) => match msg.vid.as_deref().and_then(|v| media.get(v)) {
                Some(item) => {
                    engine.events().publish(Event::MediaDownloadRequested { item });
                    sync_response(&engine, &media)
                }
                None => (400, r#"{"error":"unknown vid"}"#.to_string()),
            },
            Err(e) => bad_request(e),
        },
        ("POST", "/tab-update") => match serde_json::from_slice::<IngestMessage>(&body) {
            Ok(msg) => {
                if let (Some(tab_url), Some(title)) = (msg.tab_url.as_deref(), msg.tab_title.as_deref())
                {
                    if media.rename_tab(tab_url, title) > 0 {
                        engine.events().publish(Event::MediaUpdated);
                    }
                }
                sync_response(&engine, &media)
            }
            Err(e) => bad_request(e),
        },
        ("POST", "/clear") => {
            media.clear();
            engine.events().publish(Event::MediaCleared);
            sync_response(&engine, &media)
        }
        _ => (404, r#"{"error":"not found"}"#.to_string()),
    }
}

fn sync_response(engine: &Engine, media: &MediaStore) -> (u16, String) {
    let body = serde_json::to_string(&snapshot(engine, media))
        .unwrap_or_else(|_| "{}".to_string());
    (200, body)
}

/// Builds the config + detected-media snapshot returned on every exchange.
pub fn snapshot(engine: &Engine, media: &MediaStore) -> SyncSnapshot {
    let capture = &engine.config().capture;
    SyncSnapshot {
        enabled: capture.enabled,
        file_exts: capture.file_exts.clone(),
        blocked_hosts: capture.blocked_hosts.clone(),
        request_file_exts: capture.request_file_exts.clone(),
        media_types: capture.media_types.clone(),
        tabs_watcher: capture.tabs_watcher.clone(),
        matching_hosts: capture.matching_hosts.clone(),
        video_list: media
            .list()
            .into_iter()
            .map(|item| VideoEntry {
                id: item.id,
                text: item.name,
                info: item.description,
                tab_id: item.tab_id,
                size: item.size,
                kind: item.kind.as_str().to_string(),
            })
            .collect(),
    }
}

/// Runs one intercepted URL through the capture filter and, on match, hands
/// it to the engine. No dedup at this layer: the same URL twice is two
/// independent downloads.
async fn capture(engine: &Engine, msg: IngestMessage, autostart: bool) {
    let Ok(parsed) = Url::parse(&msg.url) else {
        tracing::debug!("capture skipped: unparseable url");
        return;
    };
    if !should_capture(&engine.config().capture, &parsed, &msg) {
        tracing::debug!(url = %msg.url, "capture filtered out");
        return;
    }

    let mut headers: HashMap<String, String> = msg.request_headers.clone().unwrap_or_default();
    if let Some(cookie) = &msg.cookie {
        headers.insert("cookie".to_string(), cookie.clone());
    }

    let request = AddRequest {
        url: media::canonical_media_url(&msg.url),
        headers,
        file_name: msg.file.clone(),
        save_dir: None,
        max_segments: None,
        queue_id: None,
        autostart,
    };
    match engine.add(request).await {
        Ok(id) => tracing::info!(id = %id, "captured download from browser agent"),
        Err(e) => tracing::warn!("capture add failed: {e:#}"),
    }
}

/// Host blocklist plus file-extension / content-type allowlist.
fn should_capture(cfg: &CaptureConfig, url: &Url, msg: &IngestMessage) -> bool {
    if !cfg.enabled {
        return false;
    }
    if let Some(host) = url.host_str() {
        let blocked = cfg
            .blocked_hosts
            .iter()
            .any(|b| host == b || host.ends_with(&format!(".{b}")));
        if blocked {
            return false;
        }
    }

    let ext = msg
        .file
        .as_deref()
        .and_then(|f| f.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()))
        .or_else(|| {
            naming::file_name_from_url(url.as_str())
                .and_then(|n| n.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()))
        });
    if let Some(ext) = ext {
        if cfg.file_exts.iter().any(|e| e.eq_ignore_ascii_case(&ext)) {
            return true;
        }
    }
    if let Some(ct) = msg.content_type.as_deref() {
        if let Some(mapped) = naming::extension_for_content_type(ct) {
            if cfg.file_exts.iter().any(|e| e.eq_ignore_ascii_case(mapped)) {
                return true;
            }
        }
    }
    false
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;

    fn msg(url: &str) -> IngestMessage {
        IngestMessage {
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn capture_filter_by_extension() {
        let cfg = CaptureConfig::default();
        let u = Url::parse("http://host.example/f.zip").unwrap();
        assert!(should_capture(&cfg, &u, &msg("http://host.example/f.zip")));

        let u = Url::parse("http://host.example/page.html").unwrap();
        assert!(!should_capture(&cfg, &u, &msg("http://host.example/page.html")));
    }

    #[test]
    fn capture_filter_by_content_type() {
        let cfg = CaptureConfig::default();
        let u = Url::parse("http://host.example/resource").unwrap();
        let mut m = msg("http://host.example/resource");
        m.content_type = Some("application/zip".to_string());
        assert!(should_capture(&cfg, &u, &m));
    }

    #[test]
    fn capture_respects_blocklist_and_enable_flag() {
        let mut cfg = CaptureConfig::default();
        cfg.blocked_hosts = vec!["blocked.example".to_string()];
        let u = Url::parse("http://blocked.example/f.zip").unwrap();
        assert!(!should_capture(&cfg, &u, &msg("http://blocked.example/f.zip")));
        let u = Url::parse("http://sub.blocked.example/f.zip").unwrap();
        assert!(!should_capture(&cfg, &u, &msg("http://sub.blocked.example/f.zip")));

        cfg.blocked_hosts.clear();
        cfg.enabled = false;
        let u = Url::parse("http://host.example/f.zip").unwrap();
        assert!(!should_capture(&cfg, &u, &msg("http://host.example/f.zip")));
    }

    #[test]
    fn subsequence_search() {
        assert_eq!(find_subsequence(b"abc\r\n\r\nrest", b"\r\n\r\n"), Some(3));
        assert_eq!(find_subsequence(b"abc", b"\r\n\r\n"), None);
    }
}
