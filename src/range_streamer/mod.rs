//! RangeStreamer - Byte-Range File Delivery
//!
//! ## Responsibilities
//!
//! - Serve a resolved artifact in full (200) or as a single byte range (206)
//! - Answer HEAD with headers only
//! - Reject malformed `Range` headers (400) and ranges outside the file
//!   (416) instead of silently serving the whole file
//!
//! Only single `bytes` ranges are supported: `a-b`, `a-` and suffix `-n`.
//! An end beyond the file is clamped to the last byte.

use crate::error::{Error, Result};
use axum::{
    body::Body,
    http::{header, HeaderValue, Method, StatusCode},
    response::Response,
};
use std::io::{ErrorKind, SeekFrom};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// A parsed `Range: bytes=...` specifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `start-end` or open ended `start-`
    FromTo { start: u64, end: Option<u64> },
    /// `-n`: the last n bytes
    Suffix(u64),
}

/// What to send for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServePlan {
    pub partial: bool,
    pub offset: u64,
    pub length: u64,
    pub size: u64,
}

impl ServePlan {
    pub fn status(&self) -> StatusCode {
        if self.partial {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        }
    }

    /// `Content-Range` value for partial responses
    pub fn content_range(&self) -> Option<String> {
        self.partial.then(|| {
            format!(
                "bytes {}-{}/{}",
                self.offset,
                self.offset + self.length - 1,
                self.size
            )
        })
    }
}

/// Parse a `Range` header value
pub fn parse_range(value: &str) -> Result<ByteRange> {
    let invalid = || Error::InvalidRange(value.to_string());

    let spec = value.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
    if spec.contains(',') {
        return Err(Error::InvalidRange(format!("multiple ranges not supported: {}", value)));
    }

    let (start, end) = spec.split_once('-').ok_or_else(invalid)?;
    let (start, end) = (start.trim(), end.trim());

    let parse = |s: &str| s.parse::<u64>().map_err(|_| invalid());

    match (start.is_empty(), end.is_empty()) {
        (true, true) => Err(invalid()),
        (true, false) => Ok(ByteRange::Suffix(parse(end)?)),
        (false, true) => Ok(ByteRange::FromTo {
            start: parse(start)?,
            end: None,
        }),
        (false, false) => {
            let (start, end) = (parse(start)?, parse(end)?);
            if end < start {
                return Err(invalid());
            }
            Ok(ByteRange::FromTo {
                start,
                end: Some(end),
            })
        }
    }
}

/// Decide status, offset and length for a file of `size` bytes
pub fn plan(size: u64, range: Option<&str>) -> Result<ServePlan> {
    let Some(value) = range else {
        return Ok(ServePlan {
            partial: false,
            offset: 0,
            length: size,
            size,
        });
    };

    let (offset, length) = match parse_range(value)? {
        ByteRange::FromTo { start, end } => {
            if start >= size {
                return Err(Error::RangeNotSatisfiable { size });
            }
            let end = end.unwrap_or(size - 1).min(size - 1);
            (start, end - start + 1)
        }
        ByteRange::Suffix(n) => {
            if n == 0 || size == 0 {
                return Err(Error::RangeNotSatisfiable { size });
            }
            let n = n.min(size);
            (size - n, n)
        }
    };

    Ok(ServePlan {
        partial: true,
        offset,
        length,
        size,
    })
}

/// Content type by file extension
pub fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Build the response for `path`
pub async fn serve(path: &Path, method: &Method, range: Option<&str>) -> Result<Response> {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(Error::NotFound(format!("file {}", path.display())));
        }
        Err(e) => return Err(e.into()),
    };

    let mime = HeaderValue::from_static(content_type(path));

    if *method == Method::HEAD {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CONTENT_LENGTH, size)
            .body(Body::empty())
            .map_err(|e| Error::Internal(e.to_string()));
    }

    let plan = plan(size, range)?;

    let mut file = tokio::fs::File::open(path).await?;
    if plan.offset > 0 {
        file.seek(SeekFrom::Start(plan.offset)).await?;
    }
    let body = Body::from_stream(ReaderStream::new(file.take(plan.length)));

    tracing::debug!(
        path = %path.display(),
        status = %plan.status(),
        offset = plan.offset,
        length = plan.length,
        size = size,
        "Serving file"
    );

    let mut builder = Response::builder()
        .status(plan.status())
        .header(header::CONTENT_TYPE, mime)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, plan.length);
    if let Some(content_range) = plan.content_range() {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }

    builder
        .body(body)
        .map_err(|e| Error::Internal(e.to_string()))
}
