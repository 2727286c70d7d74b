//! HTTP helpers shared by the handlers: request flags, byte ranges,
//! conditional requests, content types and error responses.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, NaiveDateTime, Utc};
use packstore_common::Error;
use tracing::{error, warn};

/// `Archive: 1` on PUT routes the upload into the directory archive
pub const ARCHIVE_HEADER: &str = "archive";
/// `FromArchive: 1` on GET/DELETE addresses the archived key
pub const FROM_ARCHIVE_HEADER: &str = "fromarchive";
/// `Keys: all|files|archive` lists a directory
pub const KEYS_HEADER: &str = "keys";
/// `KeysCount: all|files|archive` counts a directory
pub const KEYS_COUNT_HEADER: &str = "keyscount";
/// `Unique: 1` folds names present both as file and archive key
pub const UNIQUE_HEADER: &str = "unique";

/// Whether a flag header is set to `1`
pub fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    header_str(headers, name).is_some_and(|v| v.trim() == "1")
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parsed Range header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64, // inclusive
}

impl ByteRange {
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// How a request's Range header applies to an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    Full,
    Partial(ByteRange),
    Unsatisfiable,
}

/// Resolve the Range header against an object of `total_size` bytes.
/// Only single `bytes=` ranges are honoured; anything else serves the
/// whole object.
pub fn resolve_range(headers: &HeaderMap, total_size: u64) -> RangeRequest {
    let Some(value) = header_str(headers, header::RANGE.as_str()) else {
        return RangeRequest::Full;
    };
    let value = value.trim();
    if !value.starts_with("bytes=") || value.contains(',') {
        return RangeRequest::Full;
    }
    match parse_range_header(value, total_size) {
        Some(range) => RangeRequest::Partial(range),
        None => RangeRequest::Unsatisfiable,
    }
}

/// Parse HTTP Range header (e.g., "bytes=0-99" or "bytes=100-" or "bytes=-50")
pub fn parse_range_header(range_header: &str, total_size: u64) -> Option<ByteRange> {
    let range_spec = range_header.trim().strip_prefix("bytes=")?;
    let (start_str, end_str) = range_spec.split_once('-')?;
    let start_str = start_str.trim();
    let end_str = end_str.trim();

    if total_size == 0 || (start_str.is_empty() && end_str.is_empty()) {
        return None;
    }

    // Suffix range (bytes=-500 means last 500 bytes)
    if start_str.is_empty() {
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        return Some(ByteRange {
            start: total_size.saturating_sub(suffix_len),
            end: total_size - 1,
        });
    }

    let start: u64 = start_str.parse().ok()?;
    if start >= total_size {
        return None;
    }

    // Open-ended range (bytes=100- means from 100 to end)
    if end_str.is_empty() {
        return Some(ByteRange {
            start,
            end: total_size - 1,
        });
    }

    let end: u64 = end_str.parse().ok()?;
    if start > end {
        return None;
    }

    Some(ByteRange {
        start,
        end: end.min(total_size - 1),
    })
}

/// Convert Unix timestamp to HTTP date format (RFC 7231)
pub fn timestamp_to_http_date(ts: u64) -> String {
    DateTime::<Utc>::from_timestamp(i64::try_from(ts).unwrap_or_default(), 0)
        .map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .unwrap_or_else(|| "Thu, 01 Jan 1970 00:00:00 GMT".to_string())
}

/// Parse an HTTP date into a Unix timestamp
pub fn parse_http_date(value: &str) -> Option<u64> {
    let parsed = NaiveDateTime::parse_from_str(value.trim(), "%a, %d %b %Y %H:%M:%S GMT").ok()?;
    u64::try_from(parsed.and_utc().timestamp()).ok()
}

/// Entity tag `"<hexmtime>-<hexsize>"`
pub fn etag(mtime: u64, size: u64) -> String {
    format!("\"{mtime:x}-{size:x}\"")
}

/// Whether the conditional headers allow answering 304. `If-None-Match`
/// takes precedence over `If-Modified-Since`.
pub fn not_modified(headers: &HeaderMap, etag: &str, mtime: u64) -> bool {
    if let Some(tags) = header_str(headers, header::IF_NONE_MATCH.as_str()) {
        return tags.split(',').map(str::trim).any(|tag| {
            tag == "*" || tag.strip_prefix("W/").unwrap_or(tag) == etag
        });
    }
    header_str(headers, header::IF_MODIFIED_SINCE.as_str())
        .and_then(parse_http_date)
        .is_some_and(|since| mtime <= since)
}

/// Read/write buffer size for `remaining` bytes still to transfer
pub const fn chunk_size(remaining: u64) -> usize {
    if remaining < 64 * 1024 {
        4 * 1024
    } else if remaining < 1024 * 1024 {
        32 * 1024
    } else if remaining < 16 * 1024 * 1024 {
        256 * 1024
    } else {
        1024 * 1024
    }
}

/// Bytes inspected when sniffing content
pub const SNIFF_LEN: usize = 512;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const EXTENSION_TYPES: &[(&str, &str)] = &[
    ("html", "text/html; charset=utf-8"),
    ("htm", "text/html; charset=utf-8"),
    ("css", "text/css; charset=utf-8"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("txt", "text/plain; charset=utf-8"),
    ("md", "text/markdown; charset=utf-8"),
    ("csv", "text/csv; charset=utf-8"),
    ("xml", "application/xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("ico", "image/x-icon"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("wasm", "application/wasm"),
    ("woff2", "font/woff2"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
];

const MAGIC_TYPES: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"%PDF-", "application/pdf"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b", "application/gzip"),
    (b"\x00asm", "application/wasm"),
];

/// Content type registered for the name's extension
pub fn extension_content_type(name: &str) -> Option<&'static str> {
    let (_, ext) = name.rsplit_once('.')?;
    EXTENSION_TYPES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(ext))
        .map(|(_, content_type)| *content_type)
}

/// Content type from the file extension, falling back to sniffing `head`
pub fn content_type_for(name: &str, head: &[u8]) -> &'static str {
    extension_content_type(name).unwrap_or_else(|| sniff_content_type(head))
}

/// Guess a content type from the first bytes of an object
pub fn sniff_content_type(head: &[u8]) -> &'static str {
    let head = &head[..head.len().min(SNIFF_LEN)];
    if head.is_empty() {
        return DEFAULT_CONTENT_TYPE;
    }
    if let Some((_, content_type)) = MAGIC_TYPES.iter().find(|(magic, _)| head.starts_with(magic)) {
        return *content_type;
    }
    if head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == b"WEBP" {
        return "image/webp";
    }

    let text = head.trim_ascii_start();
    let starts_with_ci = |prefix: &[u8]| {
        text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix)
    };
    if starts_with_ci(b"<!doctype html") || starts_with_ci(b"<html") {
        return "text/html; charset=utf-8";
    }
    if starts_with_ci(b"<?xml") {
        return "text/xml; charset=utf-8";
    }

    let printable = head
        .iter()
        .all(|&b| b >= 0x20 || matches!(b, b'\t' | b'\n' | b'\r' | 0x0c));
    // A multi-byte sequence may be cut at the sniff boundary
    let utf8 = match std::str::from_utf8(head) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    };
    if printable && utf8 {
        "text/plain; charset=utf-8"
    } else {
        DEFAULT_CONTENT_TYPE
    }
}

/// Metadata common to standalone files and archived records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
    /// Unix seconds
    pub mtime: u64,
}

/// Headers sent with every object response
pub fn object_headers(info: ObjectInfo, content_type: &str, cache_max_age: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    set_header(&mut headers, header::CONTENT_TYPE, content_type);
    set_header(
        &mut headers,
        header::LAST_MODIFIED,
        &timestamp_to_http_date(info.mtime),
    );
    set_header(&mut headers, header::ETAG, &etag(info.mtime, info.size));
    set_header(
        &mut headers,
        header::CACHE_CONTROL,
        &format!("max-age={cache_max_age}"),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(info.size));
    headers
}

/// Insert a header, dropping values that are not valid header text
pub fn set_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!("Dropping invalid {} header value {:?}", name, value),
    }
}

/// Response with status, headers and body
pub fn respond(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    (status, headers, body).into_response()
}

/// Error returned by handlers, rendered as a plain-text response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    /// DELETE reports lock contention as a server error
    #[must_use]
    pub fn for_delete(self) -> Self {
        match self.0 {
            Error::LockTimeout { path } => {
                Self(Error::internal(format!("timed out acquiring lock on {path}")))
            }
            other => Self(other),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl<E> From<E> for ApiError
where
    E: Into<Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if let Error::RangeNotSatisfiable { size } = &self.0 {
            set_header(&mut headers, header::CONTENT_RANGE, &format!("bytes */{size}"));
        }
        respond(status, headers, Body::from(format!("{}\n", self.0)))
    }
}

pub type ApiResult<T = Response> = Result<T, ApiError>;
