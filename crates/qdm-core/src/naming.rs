//! File-name derivation and sanitization.
//!
//! Precedence: caller override > Content-Disposition (RFC 5987 `filename*` >
//! double-quoted > single-quoted > bare token) > URL path leaf (percent-decoded,
//! extension added from Content-Type when missing) > synthetic `download_<id>`.

/// Presentational grouping derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Video,
    Audio,
    Image,
    Archive,
    Document,
    Program,
    Other,
}

/// Derives the on-disk leaf name for a download.
pub fn derive_file_name(
    name_override: Option<&str>,
    content_disposition: Option<&str>,
    url: &str,
    content_type: Option<&str>,
    id: &str,
) -> String {
    if let Some(name) = name_override {
        let s = sanitize_file_name(name);
        if !s.is_empty() {
            return s;
        }
    }
    if let Some(name) = content_disposition.and_then(parse_content_disposition) {
        let s = sanitize_file_name(&name);
        if !s.is_empty() {
            return s;
        }
    }
    if let Some(mut name) = file_name_from_url(url) {
        if !name.contains('.') {
            if let Some(ext) = extension_for_content_type(content_type.unwrap_or("")) {
                name.push('.');
                name.push_str(ext);
            }
        }
        let s = sanitize_file_name(&name);
        if !s.is_empty() {
            return s;
        }
    }
    format!("download_{id}")
}

/// Extracts a filename from a `Content-Disposition` header value.
pub fn parse_content_disposition(value: &str) -> Option<String> {
    let mut double_quoted = None;
    let mut single_quoted = None;
    let mut token = None;

    for param in value.split(';') {
        let param = param.trim();
        let Some((name, v)) = param.split_once('=') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let v = v.trim();

        if name == "filename*" {
            // RFC 5987: CHARSET''percent-encoded. Highest precedence.
            if let Some(rest) = v.split_once("''").map(|(_, r)| r) {
                let decoded = percent_decode(rest);
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
        } else if name == "filename" {
            if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
                double_quoted = Some(unescape_quoted(&v[1..v.len() - 1]));
            } else if v.len() >= 2 && v.starts_with('\'') && v.ends_with('\'') {
                single_quoted = Some(v[1..v.len() - 1].to_string());
            } else {
                // Bare token: runs until `;` (already split) or whitespace.
                let t = v.split_whitespace().next().unwrap_or("");
                if !t.is_empty() {
                    token = Some(t.to_string());
                }
            }
        }
    }

    double_quoted
        .or(single_quoted)
        .or(token)
        .filter(|s| !s.is_empty())
}

/// Last path segment of a URL, percent-decoded. `None` for empty paths.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let leaf = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = percent_decode(leaf);
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

/// Sanitizes a candidate leaf name for the local filesystem.
///
/// Replaces `< > : " / \ | ? *` and control bytes with `_`, strips leading
/// dots, trims surrounding whitespace, and caps the result at 255 bytes.
pub fn sanitize_file_name(name: &str) -> String {
    const NAME_MAX: usize = 255;
    const REPLACED: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if REPLACED.contains(&c) || c.is_control() {
            out.push('_');
        } else {
            out.push(c);
        }
    }

    let trimmed = out.trim().trim_start_matches('.').trim();
    if trimmed.len() > NAME_MAX {
        let mut take = NAME_MAX;
        while take > 0 && !trimmed.is_char_boundary(take) {
            take -= 1;
        }
        trimmed[..take].to_string()
    } else {
        trimmed.to_string()
    }
}

/// Returns a name not present in `taken`, appending ` (1)`, ` (2)`, … before
/// the extension on collision.
pub fn unique_file_name(candidate: &str, taken: &[String]) -> String {
    if !taken.iter().any(|s| s == candidate) {
        return candidate.to_string();
    }
    let (stem, ext) = match candidate.rfind('.') {
        Some(i) if i > 0 => candidate.split_at(i),
        _ => (candidate, ""),
    };
    for n in 1u32.. {
        let name = format!("{stem} ({n}){ext}");
        if !taken.iter().any(|s| s == &name) {
            return name;
        }
    }
    unreachable!("unique_file_name: exhausted counter")
}

/// Best-effort file extension for common content types.
pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let ext = match essence.as_str() {
        "application/zip" => "zip",
        "application/gzip" => "gz",
        "application/x-tar" => "tar",
        "application/x-7z-compressed" => "7z",
        "application/x-rar-compressed" => "rar",
        "application/x-iso9660-image" => "iso",
        "application/pdf" => "pdf",
        "application/json" => "json",
        "application/xml" | "text/xml" => "xml",
        "text/html" => "html",
        "text/plain" => "txt",
        "text/csv" => "csv",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/x-matroska" => "mkv",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        "audio/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" => "wav",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        _ => return None,
    };
    Some(ext)
}

/// Maps a file name to its presentational category.
pub fn category_for(file_name: &str) -> Category {
    let ext = match file_name.rsplit_once('.') {
        Some((_, e)) => e.to_ascii_lowercase(),
        None => return Category::Other,
    };
    match ext.as_str() {
        "mp4" | "mkv" | "webm" | "avi" | "mov" | "flv" | "wmv" | "m4v" | "ts" => Category::Video,
        "mp3" | "m4a" | "flac" | "wav" | "aac" | "ogg" | "opus" | "wma" => Category::Audio,
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "svg" | "ico" => Category::Image,
        "zip" | "rar" | "7z" | "tar" | "gz" | "bz2" | "xz" | "iso" => Category::Archive,
        "pdf" | "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" | "txt" | "md" | "epub" => {
            Category::Document
        }
        "exe" | "msi" | "deb" | "rpm" | "dmg" | "apk" | "appimage" => Category::Program,
        _ => Category::Other,
    }
}

/// Percent-decodes a string, passing malformed escapes through.
pub(crate) fn percent_decode(input: &str) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let h = bytes.next().and_then(hex_digit);
            let l = bytes.next().and_then(hex_digit);
            match (h, l) {
                (Some(high), Some(low)) => out.push(high << 4 | low),
                _ => out.push(b'%'),
            }
        } else {
            out.push(b);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn unescape_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next == '"' || next == '\\' {
                    out.push(chars.next().unwrap());
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}
