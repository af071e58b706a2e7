//! On-disk blob cache.
//!
//! A typed facade around `cacache`: keyed manifests describing each blob,
//! content-addressed chunks holding its bytes, and a manager that owns the
//! active cache generation.

pub mod blob_store;
pub mod generation;
pub mod key;
pub mod record;

pub use blob_store::*;
pub use generation::*;
pub use key::*;
pub use record::*;
