//! HTTP HEAD metadata probing.
//!
//! Learns total size, range support, and a best-effort filename hint before
//! the first segment request. Redirects are followed manually (bounded) so
//! each hop can apply header hygiene and the final URL is reported back.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::str;
use std::time::Duration;

/// Redirect hops followed by the probe and by segment workers.
pub const MAX_REDIRECTS: u32 = 5;

/// Connect + response-headers budget per hop.
const HOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Result of a probe: everything the supervisor needs to plan segments.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// URL after following redirects; becomes the download's `source_url`.
    pub final_url: String,
    /// Total size in bytes, if `Content-Length` was present and parseable.
    pub total_size: Option<u64>,
    /// True if the server advertises byte ranges or exposes a known length.
    pub resumable: bool,
    /// Raw `Content-Disposition` value, if any (filename hint).
    pub content_disposition: Option<String>,
    /// `Content-Type` value, if any (extension hint).
    pub content_type: Option<String>,
}

/// Performs a HEAD with up to [`MAX_REDIRECTS`] manual hops.
///
/// Failures are soft for callers: the supervisor proceeds with unknown size
/// and `resumable = false`. Runs blocking curl; call from `spawn_blocking`.
pub fn probe(
    url: &str,
    custom_headers: &HashMap<String, String>,
    user_agent: &str,
) -> Result<ProbeResult> {
    let mut current = url.to_string();

    for _hop in 0..=MAX_REDIRECTS {
        let same_auth = same_authority(url, &current);
        let (code, headers) = head_once(&current, custom_headers, user_agent, same_auth)?;

        if (300..400).contains(&code) {
            let location = header_value(&headers, "location")
                .with_context(|| format!("HTTP {code} without Location from {current}"))?;
            current = resolve_redirect(&current, &location)?;
            continue;
        }
        if !(200..300).contains(&code) {
            anyhow::bail!("HEAD {} returned HTTP {}", current, code);
        }

        let total_size = header_value(&headers, "content-length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        let accept_ranges = header_value(&headers, "accept-ranges")
            .map(|v| v.to_ascii_lowercase().contains("bytes"))
            .unwrap_or(false);

        return Ok(ProbeResult {
            final_url: current,
            total_size,
            // Permissive fallback: a known length is treated as range-capable;
            // the worker still refuses a server that ignores Range.
            resumable: accept_ranges || total_size.is_some(),
            content_disposition: header_value(&headers, "content-disposition"),
            content_type: header_value(&headers, "content-type"),
        });
    }

    anyhow::bail!("too many redirects probing {}", url)
}

/// One HEAD exchange, no redirect following. Returns status and header lines.
fn head_once(
    url: &str,
    custom_headers: &HashMap<String, String>,
    user_agent: &str,
    same_authority: bool,
) -> Result<(u32, Vec<String>)> {
    let mut headers: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).context("invalid URL")?;
    easy.nobody(true)?; // HEAD request
    easy.useragent(user_agent)?;
    easy.connect_timeout(HOP_TIMEOUT)?;
    easy.timeout(HOP_TIMEOUT)?;

    let mut list = curl::easy::List::new();
    for (k, v) in custom_headers {
        // Credentials never cross to a different authority than requested.
        if !same_authority && is_credential_header(k) {
            continue;
        }
        list.append(&format!("{}: {}", k.trim(), v.trim()))?;
    }
    if !custom_headers.is_empty() {
        easy.http_headers(list)?;
    }

    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(s) = str::from_utf8(data) {
                let line = s.trim_end();
                // Some servers emit interim responses (e.g. 100 Continue):
                // clear on each status line so only the last block is kept.
                if line.starts_with("HTTP/") {
                    headers.clear();
                }
                headers.push(line.to_string());
            }
            true
        })?;
        transfer.perform().context("HEAD request failed")?;
    }

    let code = easy.response_code().context("no response code")? as u32;
    Ok((code, headers))
}

/// Last value of a header in a raw header block, case-insensitive.
pub(crate) fn header_value(lines: &[String], name: &str) -> Option<String> {
    let mut found = None;
    for line in lines {
        if let Some((n, v)) = line.split_once(':') {
            if n.trim().eq_ignore_ascii_case(name) {
                found = Some(v.trim().to_string());
            }
        }
    }
    found
}

/// Resolves a `Location` header against the URL of the response it came from.
pub(crate) fn resolve_redirect(base: &str, location: &str) -> Result<String> {
    let base = url::Url::parse(base).with_context(|| format!("parse base URL {base}"))?;
    let next = base
        .join(location)
        .with_context(|| format!("resolve redirect {location}"))?;
    Ok(next.into())
}

/// True when both URLs share scheme, host, and effective port.
pub(crate) fn same_authority(a: &str, b: &str) -> bool {
    match (url::Url::parse(a), url::Url::parse(b)) {
        (Ok(a), Ok(b)) => {
            a.scheme() == b.scheme()
                && a.host_str() == b.host_str()
                && a.port_or_known_default() == b.port_or_known_default()
        }
        _ => false,
    }
}

/// Headers that must not leak to a host other than the one the caller named.
pub(crate) fn is_credential_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("cookie") || name.eq_ignore_ascii_case("authorization")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_value_is_case_insensitive_last_wins() {
        let lines = vec![
            "HTTP/1.1 200 OK".to_string(),
            "Content-Length: 10".to_string(),
            "content-length: 20".to_string(),
        ];
        assert_eq!(header_value(&lines, "Content-Length").as_deref(), Some("20"));
        assert_eq!(header_value(&lines, "etag"), None);
    }

    #[test]
    fn redirect_resolution_handles_relative_paths() {
        assert_eq!(
            resolve_redirect("https://a.example/dir/file", "/other").unwrap(),
            "https://a.example/other"
        );
        assert_eq!(
            resolve_redirect("https://a.example/dir/file", "next").unwrap(),
            "https://a.example/dir/next"
        );
        assert_eq!(
            resolve_redirect("https://a.example/x", "https://b.example/y").unwrap(),
            "https://b.example/y"
        );
    }

    #[test]
    fn authority_comparison() {
        assert!(same_authority("https://a.example/x", "https://a.example/y"));
        assert!(same_authority("https://a.example/x", "https://a.example:443/y"));
        assert!(!same_authority("https://a.example/x", "http://a.example/x"));
        assert!(!same_authority("https://a.example/x", "https://cdn.example/x"));
    }

    #[test]
    fn credential_headers_detected() {
        assert!(is_credential_header("Cookie"));
        assert!(is_credential_header("authorization"));
        assert!(!is_credential_header("referer"));
    }
}
