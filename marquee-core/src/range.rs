//! Byte-range parsing and partial-content emulation over cached blobs.

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::{
    cache::{BlobRecord, BlobStore},
    error::Result,
    response::CacheResponse,
};

/// Inclusive byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `content-range` header value for this range of a `total`-byte blob.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// A `Range` request as sent by the client, before it is resolved against a
/// blob size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteRangeSpec {
    /// `bytes=START-END` or `bytes=START-`.
    From { start: u64, end: Option<u64> },
    /// `bytes=-N`: the last N bytes.
    Suffix(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("malformed range header: {0}")]
    Malformed(String),

    #[error("range {spec} not satisfiable for {total} bytes")]
    Unsatisfiable { spec: ByteRangeSpec, total: u64 },
}

impl ByteRangeSpec {
    /// Whole blob, as an open-ended range from byte 0.
    pub const FULL: ByteRangeSpec = ByteRangeSpec::From {
        start: 0,
        end: None,
    };

    /// Parse a single-range `Range` header value.
    pub fn parse(value: &str) -> std::result::Result<Self, RangeError> {
        let malformed = || RangeError::Malformed(value.to_string());

        let spec = value.trim().strip_prefix("bytes=").ok_or_else(malformed)?;
        if spec.contains(',') {
            return Err(malformed());
        }
        let (start, end) = spec.split_once('-').ok_or_else(malformed)?;
        let (start, end) = (start.trim(), end.trim());

        if start.is_empty() {
            let len = end.parse::<u64>().map_err(|_| malformed())?;
            return Ok(ByteRangeSpec::Suffix(len));
        }

        let start = start.parse::<u64>().map_err(|_| malformed())?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse::<u64>().map_err(|_| malformed())?)
        };
        Ok(ByteRangeSpec::From { start, end })
    }

    /// Resolve against a blob of `total` bytes. END defaults to (and is
    /// clamped at) the last byte. An empty or out-of-bounds result is an
    /// error, never an empty success.
    pub fn resolve(self, total: u64) -> std::result::Result<ByteRange, RangeError> {
        let unsatisfiable = RangeError::Unsatisfiable { spec: self, total };
        if total == 0 {
            return Err(unsatisfiable);
        }
        let last = total - 1;

        match self {
            ByteRangeSpec::From { start, end } => {
                if start > last {
                    return Err(unsatisfiable);
                }
                let end = match end {
                    Some(end) if end < start => return Err(unsatisfiable),
                    Some(end) => end.min(last),
                    None => last,
                };
                Ok(ByteRange { start, end })
            }
            ByteRangeSpec::Suffix(0) => Err(unsatisfiable),
            ByteRangeSpec::Suffix(len) => Ok(ByteRange {
                start: total.saturating_sub(len),
                end: last,
            }),
        }
    }

    /// Exact range when it can be known without the blob size.
    pub fn bounded(self) -> Option<ByteRange> {
        match self {
            ByteRangeSpec::From {
                start,
                end: Some(end),
            } if end >= start => Some(ByteRange { start, end }),
            _ => None,
        }
    }
}

impl fmt::Display for ByteRangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteRangeSpec::From {
                start,
                end: Some(end),
            } => write!(f, "bytes={start}-{end}"),
            ByteRangeSpec::From { start, end: None } => {
                write!(f, "bytes={start}-")
            }
            ByteRangeSpec::Suffix(len) => write!(f, "bytes=-{len}"),
        }
    }
}

impl From<ByteRange> for ByteRangeSpec {
    fn from(range: ByteRange) -> Self {
        ByteRangeSpec::From {
            start: range.start,
            end: Some(range.end),
        }
    }
}

/// Parse a `content-range: bytes START-END/TOTAL` header. TOTAL may be `*`.
pub fn parse_content_range(value: &str) -> Option<(ByteRange, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().ok()?),
    };
    Some((ByteRange { start, end }, total))
}

/// Result of asking the emulator for a slice.
#[derive(Debug)]
pub enum Slice {
    /// Served from persisted bytes.
    Hit(CacheResponse),
    /// The range is valid but not (fully) persisted yet.
    Uncovered(ByteRangeSpec),
    /// The range can never be satisfied for this blob.
    Unsatisfiable(CacheResponse),
}

/// Answers byte-range requests from cached blobs with partial-content
/// semantics, so media elements can seek without re-downloading.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeEmulator;

impl RangeEmulator {
    pub async fn slice(
        &self,
        store: &BlobStore,
        record: &BlobRecord,
        spec: ByteRangeSpec,
    ) -> Result<Slice> {
        if record.size_bytes == 0 {
            // A complete empty blob has nothing to seek into; a partial one
            // of unknown size has to ask the origin.
            return Ok(if record.is_complete() {
                Slice::Unsatisfiable(CacheResponse::range_not_satisfiable(0))
            } else {
                Slice::Uncovered(spec)
            });
        }

        let range = match spec.resolve(record.size_bytes) {
            Ok(range) => range,
            Err(err) => {
                debug!(key = %record.key, error = %err, "rejecting range");
                return Ok(Slice::Unsatisfiable(
                    CacheResponse::range_not_satisfiable(record.size_bytes),
                ));
            }
        };

        // An open-ended request may be answered with the persisted run that
        // starts at START; the client asks again for the remainder.
        let served = match spec {
            ByteRangeSpec::From { end: None, .. } => {
                record.covered_run_from(range.start)
            }
            _ => record.covers(range).then_some(range),
        };
        let Some(served) = served else {
            return Ok(Slice::Uncovered(spec));
        };

        match store.read_range(record, served).await? {
            Some(bytes) => Ok(Slice::Hit(CacheResponse::partial(
                &record.content_type,
                served,
                record.size_bytes,
                bytes,
            ))),
            None => Ok(Slice::Uncovered(spec)),
        }
    }
}
