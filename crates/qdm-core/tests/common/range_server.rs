//! Minimal HTTP/1.1 server with HEAD and Range GET support for integration
//! tests.
//!
//! Serves a single static body. Options cover the server shapes the engine
//! must survive: missing Content-Length, ignored ranges, throttled streaming,
//! Content-Disposition hints, and one-shot 503 injection per segment range.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct RangeServerOptions {
    /// If true, HEAD returns 405 (simulates servers that block HEAD).
    pub head_blocked: bool,
    /// If true, GET ignores Range and always returns 200 with the full body.
    pub ignore_ranges: bool,
    /// If true, omit `Accept-Ranges: bytes` even when ranges work.
    pub hide_ranges: bool,
    /// If true, omit `Content-Length` (body delimited by connection close).
    pub hide_length: bool,
    /// Raw `Content-Disposition` header value to send.
    pub content_disposition: Option<String>,
    /// Stream the body in `(chunk_size, delay)` steps instead of one write.
    pub throttle: Option<(usize, Duration)>,
    /// Range-start offsets that get a 503 on their first attempt only.
    pub fail_first_range_at: Vec<u64>,
}

/// Starts a server on a background thread serving `body`. Returns the base
/// URL (e.g. `http://127.0.0.1:12345/file.bin`).
pub fn start(body: Vec<u8>) -> String {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let failed_once: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let opts = opts.clone();
            let failed_once = Arc::clone(&failed_once);
            thread::spawn(move || handle(stream, &body, &opts, &failed_once));
        }
    });
    format!("http://127.0.0.1:{port}/file.bin")
}

/// Deterministic pseudo-random body (xorshift) so byte-exactness failures
/// point at real offsets instead of all-zero noise.
pub fn patterned_body(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

fn handle(
    mut stream: std::net::TcpStream,
    body: &[u8],
    opts: &RangeServerOptions,
    failed_once: &Mutex<HashSet<u64>>,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, range) = parse_request(request);
    let total = body.len() as u64;

    let mut extra = String::new();
    if !opts.hide_ranges && !opts.ignore_ranges {
        extra.push_str("Accept-Ranges: bytes\r\n");
    }
    if let Some(cd) = &opts.content_disposition {
        extra.push_str(&format!("Content-Disposition: {cd}\r\n"));
    }

    if method.eq_ignore_ascii_case("HEAD") {
        if opts.head_blocked {
            let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n");
            return;
        }
        let length = if opts.hide_length {
            String::new()
        } else {
            format!("Content-Length: {total}\r\n")
        };
        let response = format!("HTTP/1.1 200 OK\r\n{length}{extra}\r\n");
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n");
        return;
    }

    let effective_range = if opts.ignore_ranges { None } else { range };

    if let Some((start, _)) = effective_range {
        let mut failed = failed_once.lock().unwrap();
        if opts.fail_first_range_at.contains(&start) && failed.insert(start) {
            let _ = stream
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n");
            return;
        }
    }

    let (status, slice, content_range) = match effective_range {
        Some((start, end_incl)) => {
            let start = start.min(total);
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start > end_incl {
                let response = format!(
                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{total}\r\nContent-Length: 0\r\n\r\n"
                );
                let _ = stream.write_all(response.as_bytes());
                return;
            }
            let slice = &body[start as usize..=(end_incl as usize)];
            (
                "206 Partial Content",
                slice,
                format!("Content-Range: bytes {start}-{end_incl}/{total}\r\n"),
            )
        }
        None => ("200 OK", body, String::new()),
    };

    let length = if opts.hide_length {
        String::new()
    } else {
        format!("Content-Length: {}\r\n", slice.len())
    };
    let response = format!("HTTP/1.1 {status}\r\n{length}{content_range}{extra}\r\n");
    if stream.write_all(response.as_bytes()).is_err() {
        return;
    }

    match opts.throttle {
        Some((chunk, delay)) => {
            for piece in slice.chunks(chunk.max(1)) {
                if stream.write_all(piece).is_err() {
                    return;
                }
                thread::sleep(delay);
            }
        }
        None => {
            let _ = stream.write_all(slice);
        }
    }
}

/// Returns (method, optional (start, end_inclusive)) for `Range: bytes=X-Y`.
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(rest) = value.strip_prefix("bytes=") {
                    if let Some((a, b)) = rest.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, range)
}
