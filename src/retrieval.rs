//! HTTP-style retrieval of stored records
//!
//! `Store::pipe` turns a record into a ready-to-send response:
//! - `If-None-Match` equal to the record stamp yields `304 Not Modified`
//! - `Range: bytes=start-end` yields `206 Partial Content`
//! - anything else (including unusable ranges) yields `200 OK`
//! - a record that cannot be read yields `404` with a fixed body
//!
//! The payload is streamed from disk, never buffered whole.

use crate::error::{Result, StorageError};
use crate::events::StorageEvent;
use crate::mime::DEFAULT_CONTENT_TYPE;
use crate::record::{self, Header};
use crate::store::Store;
use bytes::Bytes;
use chrono::{DateTime, Months, Utc};
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Response, StatusCode};
use tokio::io::AsyncWrite;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Response body produced by retrieval
pub type BoxBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Body of every 404 response
pub const NOT_FOUND_BODY: &str = "File not found.";

/// How far in the future `Expires` points
const EXPIRES_MONTHS: u32 = 2;

/// Inclusive byte range within a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Parse a `Range` header value against a payload of `length` bytes.
    ///
    /// Accepts `bytes=start-end`, `bytes=start-` and `bytes=-suffix`; `end`
    /// past the payload is clamped. Returns `None` for anything that cannot
    /// be served as a single range, in which case the full object is sent.
    pub fn parse(value: &str, length: u64) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes=")?;
        if length == 0 || spec.contains(',') {
            return None;
        }

        let (start, end) = spec.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());
        let last = length - 1;

        let range = if start.is_empty() {
            let suffix: u64 = end.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            ByteRange {
                start: length.saturating_sub(suffix),
                end: last,
            }
        } else {
            let start: u64 = start.parse().ok()?;
            let end = if end.is_empty() {
                last
            } else {
                end.parse::<u64>().ok()?.min(last)
            };
            ByteRange { start, end }
        };

        if range.start > range.end {
            return None;
        }
        Some(range)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a payload of `total` bytes
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Whether an `If-None-Match` value matches a record stamp.
///
/// Tags may be quoted, weak (`W/`) or listed; `*` matches anything.
pub fn etag_matches(if_none_match: &str, stamp: i64) -> bool {
    let stamp = stamp.to_string();
    if_none_match.split(',').map(str::trim).any(|tag| {
        if tag == "*" {
            return true;
        }
        let tag = tag.strip_prefix("W/").unwrap_or(tag);
        tag.trim_matches('"') == stamp
    })
}

/// RFC 7231 date (`Last-Modified`, `Expires`)
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// `Content-Disposition` value forcing a download under `name`
pub fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if fallback == name {
        format!("attachment; filename=\"{}\"", name)
    } else {
        format!(
            "attachment; filename=\"{}\"; filename*=UTF-8''{}",
            fallback,
            urlencoding::encode(name)
        )
    }
}

/// Download name to advertise through `Content-Disposition`
#[derive(Debug, Clone, Copy)]
pub enum Download<'a> {
    /// The record's original name
    Original,
    Named(&'a str),
}

pub(crate) fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn text_response(status: StatusCode, text: &'static str) -> Response<BoxBody> {
    let mut response = Response::new(full_body(text));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// The fixed 404 response
pub fn not_found() -> Response<BoxBody> {
    text_response(StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}

/// Validator and caching headers shared by 200/206/304 responses
fn cache_headers(headers: &mut HeaderMap, record: &Header) {
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", record.stamp)) {
        headers.insert(header::ETAG, etag);
    }
    if let Some(modified) = DateTime::from_timestamp_millis(record.stamp) {
        if let Ok(value) = HeaderValue::from_str(&http_date(modified)) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    if let Some(expires) = Utc::now().checked_add_months(Months::new(EXPIRES_MONTHS)) {
        if let Ok(value) = HeaderValue::from_str(&http_date(expires)) {
            headers.insert(header::EXPIRES, value);
        }
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("public"));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
}

impl Store {
    /// Build an HTTP response serving record `id`.
    ///
    /// `request` carries the client's headers (`Range`, `If-None-Match`).
    /// Failures never leak: any unreadable record becomes the fixed 404.
    pub async fn pipe(
        &self,
        id: u64,
        request: Option<&HeaderMap>,
        download: Option<Download<'_>>,
    ) -> Response<BoxBody> {
        let record = match self.stat(id).await {
            Ok(record) => record,
            Err(e) => {
                debug!(id, error = %e, "Pipe of unreadable record");
                return not_found();
            }
        };

        let if_none_match = request
            .and_then(|h| h.get(header::IF_NONE_MATCH))
            .and_then(|v| v.to_str().ok());
        if let Some(value) = if_none_match {
            if etag_matches(value, record.stamp) {
                let mut response = Response::new(full_body(Bytes::new()));
                *response.status_mut() = StatusCode::NOT_MODIFIED;
                cache_headers(response.headers_mut(), &record);
                self.events().emit(StorageEvent::Pipe {
                    id,
                    header: record,
                    status: StatusCode::NOT_MODIFIED.as_u16(),
                    range: None,
                });
                return response;
            }
        }

        let range = request
            .and_then(|h| h.get(header::RANGE))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| ByteRange::parse(v, record.length));

        let (status, start, len) = match range {
            Some(r) => (StatusCode::PARTIAL_CONTENT, r.start, r.len()),
            None => (StatusCode::OK, 0, record.length),
        };

        let stream = match record::open_payload(&self.record_path(id), id, start, len).await {
            Ok(stream) => stream,
            Err(e) => {
                self.events().error(Some(id), e.to_string());
                return not_found();
            }
        };

        let body = StreamBody::new(ReaderStream::new(stream).map_ok(Frame::data)).boxed_unsync();
        let mut response = Response::new(body);
        *response.status_mut() = status;

        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&record.content_type)
                .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        if let Some(r) = range {
            if let Ok(value) = HeaderValue::from_str(&r.content_range(record.length)) {
                headers.insert(header::CONTENT_RANGE, value);
            }
        }
        cache_headers(headers, &record);

        if let Some(download) = download {
            let name = match download {
                Download::Original => record.name.as_str(),
                Download::Named(name) => name,
            };
            if let Ok(value) = HeaderValue::from_str(&content_disposition(name)) {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
        }

        debug!(id, status = status.as_u16(), length = len, "Piping record");
        self.events().emit(StorageEvent::Pipe {
            id,
            header: record,
            status: status.as_u16(),
            range: range.map(|r| (r.start, r.end)),
        });

        response
    }

    /// Copy the payload of record `id` into `writer`, returning the byte count
    pub async fn pipe_to<W>(&self, id: u64, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let record = self.stat(id).await?;
        let mut stream = record::open_payload(&self.record_path(id), id, 0, record.length)
            .await
            .map_err(|e| {
                self.events().error(Some(id), e.to_string());
                e
            })?;

        let copied = tokio::io::copy(&mut stream, writer).await.map_err(|e| {
            self.events().error(Some(id), e.to_string());
            StorageError::Io(e)
        })?;

        self.events().emit(StorageEvent::Pipe {
            id,
            header: record,
            status: StatusCode::OK.as_u16(),
            range: None,
        });
        Ok(copied)
    }
}
