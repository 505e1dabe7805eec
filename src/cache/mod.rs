//! Versioned cache buckets and the retrieval strategies built on them.
//!
//! - One named bucket per deployed version, persisted in SQLite
//! - Cache-first retrieval with write-through for first-party assets
//! - Network-first retrieval with cached fallback for external resources
//! - An offline fallback document when nothing else is available

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::SqliteStorage;
pub use traits::{
  BucketStorage, BucketSummary, EntrySummary, ResponseSource, RouteResult, StoredResponse,
};
