use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use semdex_provider::EmbeddingProvider;
use semdex_vector_store::{load_collection, HnswConfig, HnswIndexCache, LoadedCollection};
use serde::Serialize;

use crate::error::{Result, SearchError};

/// One ranked hit, mapped back from a content hash to its file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content_hash: String,
    /// `1.0 - dot_distance` over normalized vectors, descending.
    pub score: f32,
}

/// Per-stage wall time for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SearchTiming {
    pub embed_ms: u64,
    pub load_ms: u64,
    pub search_ms: u64,
    pub total_ms: u64,
    /// Whether the collection came out of the cache without a load.
    pub cache_hit: bool,
}

/// The query path over indexed collections.
///
/// A `Searcher` owns no state beyond its configuration: each call embeds
/// the query, obtains the collection (through the shared cache when one
/// is wired in), and runs the similarity search. Collections nobody has
/// indexed yet return empty results rather than erroring, so callers can
/// probe before the first run finishes.
pub struct Searcher {
    store_root: PathBuf,
    hnsw: HnswConfig,
    cache: Option<Arc<HnswIndexCache>>,
}

impl Searcher {
    /// A searcher over the collections stored under `store_root`,
    /// loading each collection directly on every query.
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            hnsw: HnswConfig::default(),
            cache: None,
        }
    }

    /// Graph parameters for loads and the query-time beam width.
    #[must_use]
    pub fn with_hnsw_config(mut self, config: HnswConfig) -> Self {
        self.hnsw = config;
        self
    }

    /// Serve collections out of a shared cache instead of loading per
    /// query. The cache is process-wide; share one across searchers.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<HnswIndexCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn store_root(&self) -> &Path {
        &self.store_root
    }

    /// Run one query against a collection.
    ///
    /// Returns the top `limit` hits best-first, and stage timings when
    /// `return_timing` is set.
    pub async fn search(
        &self,
        query: &str,
        provider: &dyn EmbeddingProvider,
        collection_name: &str,
        limit: usize,
        return_timing: bool,
    ) -> Result<(Vec<SearchResult>, Option<SearchTiming>)> {
        if query.trim().is_empty() {
            return Err(SearchError::EmptyQuery);
        }

        let total_start = Instant::now();

        // 1. Embed the query.
        let embed_start = Instant::now();
        let query_vector = provider.get_embedding(query).await?;
        let embed_ms = elapsed_ms(embed_start);

        // 2. Obtain the collection. The loader flag distinguishes a
        //    cache hit from a load this call paid for.
        let load_start = Instant::now();
        let loader_ran = AtomicBool::new(false);
        let collection: Arc<LoadedCollection> = match &self.cache {
            Some(cache) => {
                cache
                    .get_or_load(collection_name, || {
                        loader_ran.store(true, Ordering::Relaxed);
                        let root = self.store_root.clone();
                        let key = collection_name.to_string();
                        let config = self.hnsw;
                        async move { load_collection(&root, &key, config).await.map(Arc::new) }
                    })
                    .await?
            }
            None => {
                loader_ran.store(true, Ordering::Relaxed);
                Arc::new(load_collection(&self.store_root, collection_name, self.hnsw).await?)
            }
        };
        let load_ms = elapsed_ms(load_start);
        let cache_hit = !loader_ran.load(Ordering::Relaxed);

        // 3. Similarity search. No index means nothing was embedded yet.
        let search_start = Instant::now();
        let results = match collection.index() {
            Some(index) => {
                let hits = index.search(&query_vector, limit, self.hnsw.ef_search)?;
                let mut results = Vec::with_capacity(hits.len());
                for (hash, score) in hits {
                    if let Some(meta) = collection.meta(&hash) {
                        results.push(SearchResult {
                            file_path: meta.file_path.clone(),
                            start_line: meta.start_line,
                            end_line: meta.end_line,
                            content_hash: hash,
                            score,
                        });
                    } else {
                        log::debug!("hit {hash} has no metadata record; dropped");
                    }
                }
                results
            }
            None => {
                log::debug!("collection {collection_name} holds no vectors yet");
                Vec::new()
            }
        };
        let search_ms = elapsed_ms(search_start);
        let total_ms = elapsed_ms(total_start);

        log::info!(
            "search over {collection_name}: {} hits in {total_ms}ms (cache hit: {cache_hit})",
            results.len(),
        );

        let timing = return_timing.then_some(SearchTiming {
            embed_ms,
            load_ms,
            search_ms,
            total_ms,
            cache_hit,
        });
        Ok((results, timing))
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
