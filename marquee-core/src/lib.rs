//! # Marquee Core
//!
//! Offline media cache and request interception for a kiosk signage player.
//!
//! The renderer's network requests are classified by URL shape and answered
//! from an on-disk blob cache wherever possible:
//!
//! - [`cache`]: `cacache`-backed blob store with partial (range) records and
//!   generation rollover
//! - [`range`]: byte-range parsing and the range emulator serving 206 slices
//! - [`fetcher`]: on-demand range fetches and background whole-file downloads
//! - [`router`]: request classification and the `intercept` entry point
//! - [`resilience`]: widget markup with bounded retry, stale fallback and a
//!   placeholder
//! - [`sync`]: ingest side used by the collection/sync process

pub mod cache;
pub mod error;
pub mod fetcher;
pub mod media_type;
pub mod origin;
pub mod range;
pub mod required;
pub mod resilience;
pub mod response;
pub mod router;
pub mod sync;

pub use cache::{BlobRecord, BlobStore, CacheKey, CacheManager, Completeness, KeyKind};
pub use error::{CacheError, Result};
pub use fetcher::{ChunkFetcher, DEFAULT_CHUNK_SIZE, FetchTarget, FetcherStats};
pub use origin::{HttpOrigin, Origin, OriginRequest, OriginResponse};
pub use range::{ByteRange, ByteRangeSpec, RangeEmulator, Slice};
pub use required::{FileDescriptor, RequiredFiles};
pub use resilience::{
    MarkupOutcome, MarkupSource, OriginMarkupSource, RetryPolicy, WidgetMarkupService,
};
pub use response::{CACHE_STATUS_HEADER, CacheResponse, CacheStatus};
pub use router::{
    Classification, Classifier, InterceptRequest, Interception, RequestDescriptor,
    RequestRouter, RouterSettings,
};
pub use sync::{SyncIngest, SyncReport};
