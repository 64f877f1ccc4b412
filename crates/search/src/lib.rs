//! # Semdex Search
//!
//! The query path over collections built by the indexer.
//!
//! ## Pipeline
//!
//! ```text
//! query text
//!     │
//!     ├──> EmbeddingProvider::get_embedding
//!     │
//!     ├──> HnswIndexCache::get_or_load (single-flight per collection)
//!     │      └─> load_collection: saved index, or rebuild from records
//!     │
//!     └──> HnswIndex::search
//!            └─> SearchResult { file_path, lines, content_hash, score }
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use semdex_provider::EmbeddingProvider;
//! use semdex_search::Searcher;
//! use semdex_vector_store::HnswIndexCache;
//!
//! async fn run(provider: Arc<dyn EmbeddingProvider>) -> anyhow::Result<()> {
//!     let cache = Arc::new(HnswIndexCache::new(Duration::from_secs(300)));
//!     let searcher = Searcher::new("/path/to/store").with_cache(cache);
//!
//!     let (results, timing) = searcher
//!         .search("lease heartbeat", provider.as_ref(), "proj__api__small", 10, true)
//!         .await?;
//!     for hit in &results {
//!         println!("{:.3}  {}:{}", hit.score, hit.file_path, hit.start_line);
//!     }
//!     if let Some(timing) = timing {
//!         println!("loaded in {}ms (cache hit: {})", timing.load_ms, timing.cache_hit);
//!     }
//!     Ok(())
//! }
//! ```

mod error;
mod search;

pub use error::{Result, SearchError};
pub use search::{SearchResult, SearchTiming, Searcher};
