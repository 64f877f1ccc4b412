//! # Semdex Vector Store
//!
//! Durable storage for embedded chunks and the similarity index over
//! them.
//!
//! ## Layout
//!
//! ```text
//! <root>/collections/<project__provider__model>/
//!     ├── content.json     content records, hash-addressed, deduped
//!     ├── visibility.json  (branch, path, chunk) → content hash
//!     └── index.hnsw       SDXH index over content vectors
//! ```
//!
//! Content records are written once per unique chunk hash; branches
//! share them through visibility records, so checking out a branch
//! that mostly matches an indexed one costs almost nothing to index.
//! Queries go through [`load_collection`], usually behind an
//! [`HnswIndexCache`] so the graph rebuild is paid once per idle
//! period instead of once per query.

mod cache;
mod collection;
mod error;
mod hnsw;
mod record;
mod store;

pub use cache::{CacheStats, HnswIndexCache};
pub use collection::{index_path, load_collection, ChunkMeta, LoadedCollection, INDEX_FILE_NAME};
pub use error::{Result, VectorStoreError};
pub use hnsw::{
    HnswConfig, HnswIndex, DEFAULT_EF_CONSTRUCTION, DEFAULT_EF_SEARCH, DEFAULT_M,
    DEFAULT_MAX_LAYER, HNSW_FORMAT_VERSION, HNSW_MAGIC,
};
pub use record::{collection_key, content_hash, ContentRecord, VisibilityKey, VisibilityRecord};
pub use store::{VectorStore, VisibilityOutcome};
