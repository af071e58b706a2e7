use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::CacheKey;
use crate::range::ByteRange;

pub(crate) const RECORD_SCHEMA_VERSION: u32 = 1;

/// Whether every byte of a blob has been persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Partial,
    Complete,
}

/// One persisted byte range of a blob, stored content-addressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    pub integrity: String,
    /// Issue order of the fetch that produced this chunk.
    pub issued: u64,
}

impl ChunkRef {
    pub fn range(&self) -> ByteRange {
        ByteRange {
            start: self.start,
            end: self.end,
        }
    }

    fn contains(&self, other: &ChunkRef) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// A step of a planned read: take `len` bytes starting at `offset` inside the
/// chunk identified by `integrity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReadStep {
    pub integrity: String,
    pub offset: u64,
    pub len: u64,
}

/// Metadata of a cached blob plus the chunks that make up its payload.
///
/// Records are persisted as a single manifest entry that is replaced on every
/// append, so readers observe either the old or the new chunk list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRecord {
    pub schema_version: u32,
    pub key: CacheKey,
    pub content_type: String,
    /// Total expected size; 0 while unknown.
    pub size_bytes: u64,
    pub completeness: Completeness,
    #[serde(default)]
    pub chunks: Vec<ChunkRef>,
    pub updated_at: DateTime<Utc>,
}

impl BlobRecord {
    pub(crate) fn empty(
        key: CacheKey,
        content_type: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            key,
            content_type: content_type.into(),
            size_bytes,
            completeness: Completeness::Partial,
            chunks: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completeness == Completeness::Complete
    }

    /// Merged, sorted list of persisted ranges.
    pub fn covered_ranges(&self) -> Vec<ByteRange> {
        let mut ranges: Vec<ByteRange> =
            self.chunks.iter().map(ChunkRef::range).collect();
        ranges.sort_by_key(|r| r.start);

        let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.start <= last.end.saturating_add(1) => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        merged
    }

    pub fn persisted_bytes(&self) -> u64 {
        self.covered_ranges().iter().map(ByteRange::len).sum()
    }

    pub fn covers(&self, range: ByteRange) -> bool {
        self.covered_ranges()
            .iter()
            .any(|r| r.start <= range.start && range.end <= r.end)
    }

    /// Longest persisted run beginning at `start`.
    pub fn covered_run_from(&self, start: u64) -> Option<ByteRange> {
        self.covered_ranges()
            .into_iter()
            .find(|r| r.start <= start && start <= r.end)
            .map(|r| ByteRange { start, end: r.end })
    }

    /// True once the chunks cover `[0, size_bytes)` without gaps.
    pub fn is_fully_covered(&self) -> bool {
        self.size_bytes > 0
            && self.covers(ByteRange {
                start: 0,
                end: self.size_bytes - 1,
            })
    }

    /// Add a freshly fetched chunk.
    ///
    /// Overlaps resolve by issue order: a chunk is dropped when a later-issued
    /// chunk fully contains it. Returns `false` when the new chunk was already
    /// superseded and nothing changed.
    pub(crate) fn insert_chunk(&mut self, chunk: ChunkRef) -> bool {
        if self
            .chunks
            .iter()
            .any(|c| c.issued > chunk.issued && c.contains(&chunk))
        {
            return false;
        }

        self.chunks
            .retain(|c| !(c.issued < chunk.issued && chunk.contains(c)));
        self.chunks.push(chunk);
        self.chunks.sort_by_key(|c| (c.start, c.issued));
        self.updated_at = Utc::now();
        true
    }

    /// Plan how to assemble `range` from persisted chunks, preferring the
    /// most recently issued chunk at every position. `None` when any byte of
    /// the range is missing.
    pub(crate) fn plan_read(&self, range: ByteRange) -> Option<Vec<ReadStep>> {
        let mut steps = Vec::new();
        let mut pos = range.start;

        loop {
            let chunk = self
                .chunks
                .iter()
                .filter(|c| c.start <= pos && pos <= c.end)
                .max_by_key(|c| (c.issued, c.end))?;

            // A later-issued chunk starting inside this one takes over there.
            let mut upto = chunk.end.min(range.end);
            if let Some(next) = self
                .chunks
                .iter()
                .filter(|c| c.issued > chunk.issued && c.start > pos && c.start <= upto)
                .map(|c| c.start)
                .min()
            {
                upto = next - 1;
            }
            steps.push(ReadStep {
                integrity: chunk.integrity.clone(),
                offset: pos - chunk.start,
                len: upto - pos + 1,
            });

            if upto >= range.end {
                return Some(steps);
            }
            pos = upto + 1;
        }
    }
}
