//! Indexing configuration.
//!
//! Every field has a serde default, so a partial TOML file (or no file
//! at all) yields a working configuration. Validation happens once, up
//! front, in [`IndexerConfig::validate`]; the rest of the crate assumes
//! a validated config.

use std::path::Path;
use std::time::Duration;

use semdex_provider::{RateLimiterConfig, RetryPolicy};
use semdex_vector_store::HnswConfig;
use serde::{Deserialize, Serialize};

use crate::error::{IndexerError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Texts per embedding request. Default: 32.
    pub batch_size: usize,

    /// Concurrent embedding workers. Default: 4.
    pub vector_thread_count: usize,

    /// Characters per chunk. Default: 2000.
    pub chunk_chars: usize,

    /// Characters shared between adjacent chunks. Default: 200.
    pub chunk_overlap_chars: usize,

    /// Files larger than this are skipped. Default: 1 MiB.
    pub max_file_bytes: u64,

    /// Extensions eligible for indexing, without the leading dot.
    /// Default: a fixed set of common source and prose extensions.
    pub include_extensions: Vec<String>,

    /// Glob patterns excluded from discovery, matched against paths
    /// relative to the project root. Default: empty.
    pub exclude_patterns: Vec<String>,

    /// Lease refresh cadence in seconds. Default: 10.
    pub heartbeat_interval_secs: u64,

    /// Lease age after which a silent owner is presumed dead, in
    /// seconds. Must be at least three heartbeat intervals.
    /// Default: 120.
    pub lease_cooloff_secs: u64,

    /// Provider request budget per minute. Default: 60.
    pub requests_per_minute: u32,

    /// Provider token budget per minute. Default: 100 000.
    pub tokens_per_minute: u64,

    /// Throttle classification window in seconds. Default: 60.
    pub throttle_window_secs: u64,

    /// Attempts per embedding batch, including the first. Default: 3.
    pub max_retries: u32,

    /// Idle TTL for cached collection indexes, in seconds.
    /// Default: 300.
    pub cache_ttl_secs: u64,

    /// HNSW max connections per node. Default: 16.
    pub hnsw_m: usize,

    /// HNSW build-time beam width. Default: 200.
    pub hnsw_ef_construction: usize,

    /// HNSW query-time beam width. Default: 100.
    pub hnsw_ef_search: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            vector_thread_count: 4,
            chunk_chars: 2000,
            chunk_overlap_chars: 200,
            max_file_bytes: 1024 * 1024,
            include_extensions: default_extensions(),
            exclude_patterns: Vec::new(),
            heartbeat_interval_secs: 10,
            lease_cooloff_secs: 120,
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
            throttle_window_secs: 60,
            max_retries: 3,
            cache_ttl_secs: 300,
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 100,
        }
    }
}

fn default_extensions() -> Vec<String> {
    [
        "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "c", "h", "cpp", "hpp", "cs", "rb",
        "php", "swift", "kt", "scala", "sh", "sql", "md", "toml", "yaml", "yml", "json",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

impl IndexerConfig {
    /// Load a config from a TOML file, falling back to defaults for
    /// absent fields, and validate it.
    pub async fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| IndexerError::Configuration(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot drive a run.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(config_error("batch_size must be at least 1"));
        }
        if self.vector_thread_count == 0 {
            return Err(config_error("vector_thread_count must be at least 1"));
        }
        if self.chunk_chars == 0 {
            return Err(config_error("chunk_chars must be greater than zero"));
        }
        if self.chunk_overlap_chars >= self.chunk_chars {
            return Err(config_error(
                "chunk_overlap_chars must be smaller than chunk_chars",
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(config_error("heartbeat_interval_secs must be at least 1"));
        }
        if self.lease_cooloff_secs < 3 * self.heartbeat_interval_secs {
            return Err(config_error(
                "lease_cooloff_secs must be at least 3x heartbeat_interval_secs",
            ));
        }
        if self.requests_per_minute == 0 {
            return Err(config_error("requests_per_minute must be at least 1"));
        }
        if self.tokens_per_minute == 0 {
            return Err(config_error("tokens_per_minute must be at least 1"));
        }
        if self.max_retries == 0 {
            return Err(config_error("max_retries must be at least 1"));
        }
        if self.hnsw_m == 0 || self.hnsw_m > 256 {
            return Err(config_error("hnsw_m must be between 1 and 256"));
        }
        if self.hnsw_ef_construction == 0 || self.hnsw_ef_search == 0 {
            return Err(config_error(
                "hnsw_ef_construction and hnsw_ef_search must be greater than zero",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub fn lease_cooloff(&self) -> Duration {
        Duration::from_secs(self.lease_cooloff_secs)
    }

    #[must_use]
    pub fn throttle_window(&self) -> Duration {
        Duration::from_secs(self.throttle_window_secs)
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    #[must_use]
    pub fn rate_limits(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            requests_per_minute: self.requests_per_minute,
            tokens_per_minute: self.tokens_per_minute,
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            ..RetryPolicy::default()
        }
    }

    #[must_use]
    pub fn hnsw(&self) -> HnswConfig {
        HnswConfig {
            m: self.hnsw_m,
            ef_construction: self.hnsw_ef_construction,
            ef_search: self.hnsw_ef_search,
            ..HnswConfig::default()
        }
    }
}

fn config_error(message: &str) -> IndexerError {
    IndexerError::Configuration(message.to_string())
}
