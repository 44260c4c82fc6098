//! Segment worker: one ranged GET streamed into one part-file.
//!
//! Runs blocking curl on a `spawn_blocking` thread. Progress deltas flow to
//! the supervisor over a bounded channel; the worker owns nothing but its own
//! segment. Cancellation is cooperative: the abort flag is checked on every
//! received chunk and in the transfer's progress callback.

use crate::probe::{is_credential_header, resolve_redirect, same_authority, MAX_REDIRECTS};
use crate::ratelimit::RateLimiter;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Connect + response-headers budget.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// A transfer below 1 B/s for this long counts as an idle-read timeout.
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Hop-by-hop and conditional headers never forwarded from the caller.
const STRIPPED_HEADERS: &[&str] = &[
    "accept",
    "if-none-match",
    "if-modified-since",
    "authorization",
    "proxy-authorization",
    "connection",
    "expect",
    "te",
    "upgrade",
    "range",
    "transfer-encoding",
    "content-type",
    "content-length",
    "content-encoding",
];

/// Everything a worker needs to fetch one segment, snapshotted at spawn.
#[derive(Debug, Clone)]
pub(crate) struct SegmentJob {
    pub segment_id: u32,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub user_agent: String,
    pub part_path: PathBuf,
    /// Absolute start byte of this segment in the final file.
    pub offset: u64,
    /// `None` for the single open-ended segment of non-resumable downloads.
    pub length: Option<u64>,
    /// Persisted byte counter; reconciled against the part-file before streaming.
    pub downloaded: u64,
    pub resumable: bool,
}

/// Progress messages from workers to the supervisor.
#[derive(Debug)]
pub(crate) enum WorkerMsg {
    /// The part-file on disk disagreed with the persisted counter; the
    /// supervisor must adopt this absolute value for the segment.
    Rebase { segment_id: u32, downloaded: u64 },
    Chunk { segment_id: u32, bytes: u64 },
    /// The server redirected; siblings pick the new URL up on their next retry.
    Redirect { url: String },
}

/// Terminal state of one worker invocation.
#[derive(Debug)]
pub(crate) enum SegmentOutcome {
    Finished,
    /// Cancellation sentinel: pause/stop, never surfaced as an error.
    Cancelled,
    Failed(SegmentError),
}

/// Classified per-segment failure.
#[derive(Debug)]
pub(crate) enum SegmentError {
    /// Response status >= 400.
    Http(u32),
    /// curl transport failure (connect, TLS, idle timeout, ...).
    Transport(curl::Error),
    /// Clean EOF before the full range arrived.
    ShortRead { expected: u64, received: u64 },
    /// Server answered 200 to a mid-file Range request.
    RangeIgnored,
    TooManyRedirects,
    BadLocation(String),
    /// Local part-file I/O failed.
    Disk(std::io::Error),
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentError::Http(code) => write!(f, "HTTP {code}"),
            SegmentError::Transport(e) => write!(f, "{e}"),
            SegmentError::ShortRead { expected, received } => {
                write!(f, "short read: expected {expected} bytes, got {received}")
            }
            SegmentError::RangeIgnored => write!(f, "server ignored Range request"),
            SegmentError::TooManyRedirects => write!(f, "too many redirects"),
            SegmentError::BadLocation(loc) => write!(f, "unresolvable redirect: {loc}"),
            SegmentError::Disk(e) => write!(f, "disk write: {e}"),
        }
    }
}

impl std::error::Error for SegmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SegmentError::Transport(e) => Some(e),
            SegmentError::Disk(e) => Some(e),
            _ => None,
        }
    }
}

enum Hop {
    Complete,
    Redirect(String),
    Cancelled,
}

/// Fetches one segment, resuming from `offset + downloaded`.
pub(crate) fn run_segment(
    job: SegmentJob,
    abort: Arc<AtomicBool>,
    limiter: RateLimiter,
    tx: mpsc::Sender<WorkerMsg>,
) -> SegmentOutcome {
    match run_inner(&job, &abort, &limiter, &tx) {
        Ok(true) => SegmentOutcome::Finished,
        Ok(false) => SegmentOutcome::Cancelled,
        Err(e) => SegmentOutcome::Failed(e),
    }
}

fn run_inner(
    job: &SegmentJob,
    abort: &AtomicBool,
    limiter: &RateLimiter,
    tx: &mpsc::Sender<WorkerMsg>,
) -> Result<bool, SegmentError> {
    let can_range = job.resumable && job.length.is_some();

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&job.part_path)
        .map_err(SegmentError::Disk)?;
    let disk_len = file.metadata().map_err(SegmentError::Disk)?.len();

    let mut downloaded = job.downloaded;
    if !can_range {
        // No Range support means no mid-stream resume: restart from zero.
        if disk_len > 0 {
            file.set_len(0).map_err(SegmentError::Disk)?;
        }
        if downloaded != 0 {
            downloaded = 0;
            let _ = tx.blocking_send(WorkerMsg::Rebase {
                segment_id: job.segment_id,
                downloaded: 0,
            });
        }
    } else if disk_len > downloaded {
        // Never trust bytes ahead of persisted state.
        file.set_len(downloaded).map_err(SegmentError::Disk)?;
    } else if disk_len < downloaded {
        // The process died between disk write and store flush going the other
        // way; the missing bytes can be re-fetched, not invented.
        downloaded = disk_len;
        let _ = tx.blocking_send(WorkerMsg::Rebase {
            segment_id: job.segment_id,
            downloaded,
        });
    }

    if let Some(len) = job.length {
        if downloaded >= len {
            return Ok(true);
        }
    }
    file.seek(SeekFrom::Start(downloaded)).map_err(SegmentError::Disk)?;

    let mut current_url = job.url.clone();
    for _hop in 0..=MAX_REDIRECTS {
        if abort.load(Ordering::Relaxed) {
            return Ok(false);
        }
        match perform_hop(job, &current_url, can_range, &mut downloaded, &mut file, abort, limiter, tx)? {
            Hop::Cancelled => return Ok(false),
            Hop::Redirect(next) => {
                let _ = tx.blocking_send(WorkerMsg::Redirect { url: next.clone() });
                current_url = next;
            }
            Hop::Complete => {
                return match job.length {
                    None => Ok(true),
                    Some(len) if downloaded == len => Ok(true),
                    Some(len) => Err(SegmentError::ShortRead {
                        expected: len,
                        received: downloaded,
                    }),
                };
            }
        }
    }
    Err(SegmentError::TooManyRedirects)
}

#[allow(clippy::too_many_arguments)]
fn perform_hop(
    job: &SegmentJob,
    url: &str,
    can_range: bool,
    downloaded: &mut u64,
    file: &mut File,
    abort: &AtomicBool,
    limiter: &RateLimiter,
    tx: &mpsc::Sender<WorkerMsg>,
) -> Result<Hop, SegmentError> {
    let base = *downloaded;
    let range_start = job.offset + base;

    let status = Cell::new(0u32);
    let location: RefCell<Option<String>> = RefCell::new(None);
    let received = Cell::new(0u64);
    let aborted = Cell::new(false);
    let filled = Cell::new(false);
    let range_ignored = Cell::new(false);
    let write_err: RefCell<Option<std::io::Error>> = RefCell::new(None);

    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(SegmentError::Transport)?;
    easy.useragent(&job.user_agent).map_err(SegmentError::Transport)?;
    easy.connect_timeout(CONNECT_TIMEOUT).map_err(SegmentError::Transport)?;
    easy.low_speed_limit(1).map_err(SegmentError::Transport)?;
    easy.low_speed_time(IDLE_READ_TIMEOUT).map_err(SegmentError::Transport)?;
    easy.progress(true).map_err(SegmentError::Transport)?;
    if can_range {
        let end = job.offset + job.length.unwrap() - 1;
        easy.range(&format!("{range_start}-{end}"))
            .map_err(SegmentError::Transport)?;
    }

    let mut list = curl::easy::List::new();
    for (k, v) in sanitized_headers(&job.headers, same_authority(&job.url, url)) {
        list.append(&format!("{k}: {v}")).map_err(SegmentError::Transport)?;
    }
    easy.http_headers(list).map_err(SegmentError::Transport)?;

    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    let line = s.trim_end();
                    if line.starts_with("HTTP/") {
                        status.set(parse_status_line(line).unwrap_or(0));
                        location.replace(None);
                    } else if let Some((name, value)) = line.split_once(':') {
                        if name.trim().eq_ignore_ascii_case("location") {
                            location.replace(Some(value.trim().to_string()));
                        }
                    }
                }
                true
            })
            .map_err(SegmentError::Transport)?;
        transfer
            .progress_function(|_, _, _, _| !abort.load(Ordering::Relaxed))
            .map_err(SegmentError::Transport)?;
        transfer
            .write_function(|data| {
                if abort.load(Ordering::Relaxed) {
                    aborted.set(true);
                    return Ok(0);
                }
                let st = status.get();
                if !(200..300).contains(&st) {
                    // Drain redirect/error bodies without touching the part-file.
                    return Ok(data.len());
                }
                if can_range && st == 200 && range_start > 0 {
                    // A 200 to a mid-file Range request would restream from
                    // byte zero; appending it would corrupt the segment.
                    range_ignored.set(true);
                    return Ok(0);
                }
                let mut take = data.len() as u64;
                if let Some(len) = job.length {
                    let remaining = len.saturating_sub(base + received.get());
                    if remaining == 0 {
                        filled.set(true);
                        return Ok(0);
                    }
                    take = take.min(remaining);
                }
                limiter.acquire(take);
                if let Err(e) = file.write_all(&data[..take as usize]) {
                    write_err.replace(Some(e));
                    return Ok(0);
                }
                received.set(received.get() + take);
                if tx
                    .blocking_send(WorkerMsg::Chunk {
                        segment_id: job.segment_id,
                        bytes: take,
                    })
                    .is_err()
                {
                    // Supervisor gone; treat like cancellation.
                    aborted.set(true);
                    return Ok(0);
                }
                if (take as usize) < data.len() {
                    filled.set(true);
                    return Ok(0);
                }
                Ok(data.len())
            })
            .map_err(SegmentError::Transport)?;

        if let Err(e) = transfer.perform() {
            if aborted.get() || abort.load(Ordering::Relaxed) {
                return Ok(Hop::Cancelled);
            }
            if !filled.get() {
                if range_ignored.get() {
                    return Err(SegmentError::RangeIgnored);
                }
                if let Some(io) = write_err.borrow_mut().take() {
                    return Err(SegmentError::Disk(io));
                }
                return Err(SegmentError::Transport(e));
            }
        }
    }

    let code = easy.response_code().map_err(SegmentError::Transport)? as u32;
    if (300..400).contains(&code) {
        let loc = location
            .borrow()
            .clone()
            .ok_or(SegmentError::Http(code))?;
        let next = resolve_redirect(url, &loc).map_err(|_| SegmentError::BadLocation(loc))?;
        return Ok(Hop::Redirect(next));
    }
    if !(200..300).contains(&code) {
        return Err(SegmentError::Http(code));
    }
    if range_ignored.get() {
        return Err(SegmentError::RangeIgnored);
    }

    *downloaded = base + received.get();
    Ok(Hop::Complete)
}

/// HTTP/1.1 or HTTP/2 status line → status code.
fn parse_status_line(line: &str) -> Option<u32> {
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Applies outbound header hygiene to the caller-supplied headers.
///
/// Hop-by-hop and conditional headers are always stripped (the worker injects
/// its own `Range`); cookies additionally never cross to a redirect target on
/// a different authority than the caller named.
pub(crate) fn sanitized_headers(
    headers: &HashMap<String, String>,
    same_authority: bool,
) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(k, _)| {
            let k = k.trim();
            if STRIPPED_HEADERS.iter().any(|s| k.eq_ignore_ascii_case(s)) {
                return false;
            }
            if !same_authority && is_credential_header(k) {
                return false;
            }
            true
        })
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}
