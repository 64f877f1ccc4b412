//! HNSW approximate nearest-neighbor index over content records.
//!
//! Wraps `hnsw_rs` behind a content-hash API and a deterministic
//! on-disk `SDXH` format. The graph itself is not serialized: loading
//! re-inserts the stored vectors, which is the expensive path the
//! collection cache exists to amortize.

use std::io::{Cursor, ErrorKind, Read};
use std::path::Path;

use hnsw_rs::prelude::{DistDot, Hnsw};

use crate::error::{Result, VectorStoreError};

/// Magic bytes for serialized indices.
pub const HNSW_MAGIC: [u8; 4] = *b"SDXH";
/// Supported index file version.
pub const HNSW_FORMAT_VERSION: u16 = 1;

/// Default HNSW `M` (max connections per node).
pub const DEFAULT_M: usize = 16;
/// Default build-time beam width.
pub const DEFAULT_EF_CONSTRUCTION: usize = 200;
/// Default query-time beam width.
pub const DEFAULT_EF_SEARCH: usize = 100;
/// Default max layer depth.
pub const DEFAULT_MAX_LAYER: usize = 16;
const DIST_DOT_SHRINK: f32 = 0.999_999;

/// Construction and query parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswConfig {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_layer: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: DEFAULT_M,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            ef_search: DEFAULT_EF_SEARCH,
            max_layer: DEFAULT_MAX_LAYER,
        }
    }
}

/// Similarity index mapping neighbor slots back to content hashes.
pub struct HnswIndex {
    hnsw: Hnsw<'static, f32, DistDot>,
    hashes: Vec<String>,
    vectors: Vec<Vec<f32>>,
    dimension: usize,
    config: HnswConfig,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("records", &self.hashes.len())
            .field("dimension", &self.dimension)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HnswIndex {
    /// Build an index from aligned (hash, vector) pairs.
    ///
    /// Vectors are L2-normalized and shrunk slightly below unit norm,
    /// so `DistDot` behaves as cosine distance. Refuses empty input:
    /// an index with nothing in it should never exist on disk.
    pub fn build(hashes: Vec<String>, vectors: Vec<Vec<f32>>, config: HnswConfig) -> Result<Self> {
        validate_config(&config)?;
        if hashes.is_empty() {
            return Err(VectorStoreError::EmptyIndex);
        }
        if hashes.len() != vectors.len() {
            return Err(VectorStoreError::InvalidParameter {
                field: "vectors",
                reason: format!("{} hashes but {} vectors", hashes.len(), vectors.len()),
            });
        }
        let dimension = vectors[0].len();
        if dimension == 0 {
            return Err(VectorStoreError::InvalidParameter {
                field: "dimension",
                reason: "must be greater than zero".to_string(),
            });
        }

        let mut normalized = Vec::with_capacity(vectors.len());
        for (idx, vector) in vectors.into_iter().enumerate() {
            if vector.len() != dimension {
                return Err(VectorStoreError::DimensionMismatch {
                    expected: dimension,
                    found: vector.len(),
                });
            }
            if vector.iter().any(|value| !value.is_finite()) {
                return Err(VectorStoreError::InvalidParameter {
                    field: "vector",
                    reason: format!("non-finite component in record {idx}"),
                });
            }
            normalized.push(normalize_for_dist_dot(vector));
        }

        let hnsw = Hnsw::new(
            config.m,
            hashes.len(),
            config.max_layer,
            config.ef_construction,
            DistDot,
        );
        let pairs: Vec<(&Vec<f32>, usize)> = normalized
            .iter()
            .enumerate()
            .map(|(index, vector)| (vector, index))
            .collect();
        hnsw.parallel_insert(&pairs);

        Ok(Self {
            hnsw,
            hashes,
            vectors: normalized,
            dimension,
            config,
        })
    }

    /// Nearest content hashes for a query vector, best first.
    ///
    /// Scores are `1.0 - dot_distance`, so identical direction scores
    /// just under 1.0 and orthogonal vectors score near 0.0. Ties
    /// break on hash order for determinism.
    pub fn search(&self, query: &[f32], limit: usize, ef_search: usize) -> Result<Vec<(String, f32)>> {
        if query.len() != self.dimension {
            return Err(VectorStoreError::DimensionMismatch {
                expected: self.dimension,
                found: query.len(),
            });
        }
        if limit == 0 {
            return Ok(Vec::new());
        }
        let effective_k = limit.min(self.hashes.len());
        let effective_ef = ef_search.max(effective_k).max(1);
        let normalized = normalize_for_dist_dot(query.to_vec());

        let neighbours = self.hnsw.search(&normalized, effective_k, effective_ef);
        let mut hits = Vec::with_capacity(neighbours.len());
        for neighbour in neighbours {
            let hash = self.hashes.get(neighbour.d_id).ok_or_else(|| {
                VectorStoreError::Other(format!(
                    "neighbour id {} outside hash table of {}",
                    neighbour.d_id,
                    self.hashes.len()
                ))
            })?;
            hits.push((hash.clone(), 1.0 - neighbour.distance));
        }
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(hits)
    }

    /// Whether this index covers exactly the given hashes, in order.
    /// A stale index (store changed since the save) must be rebuilt.
    #[must_use]
    pub fn matches(&self, hashes: &[String]) -> bool {
        self.hashes.as_slice() == hashes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn config(&self) -> HnswConfig {
        self.config
    }

    /// Serialize to `SDXH` bytes: header, then hash table interleaved
    /// with little-endian vector data.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&HNSW_MAGIC);
        out.extend_from_slice(&HNSW_FORMAT_VERSION.to_le_bytes());
        push_u32(&mut out, self.dimension, "dimension")?;
        push_u32(&mut out, self.hashes.len(), "record_count")?;
        push_u32(&mut out, self.config.m, "m")?;
        push_u32(&mut out, self.config.ef_construction, "ef_construction")?;
        push_u32(&mut out, self.config.ef_search, "ef_search")?;
        push_u32(&mut out, self.config.max_layer, "max_layer")?;
        for (hash, vector) in self.hashes.iter().zip(&self.vectors) {
            push_u32(&mut out, hash.len(), "hash_len")?;
            out.extend_from_slice(hash.as_bytes());
            for value in vector {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        Ok(out)
    }

    /// Persist atomically (tmp then rename).
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = self.to_bytes()?;
        let tmp = path.with_extension("hnsw.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Load an index file and rebuild the in-memory graph.
    ///
    /// Rebuilding re-inserts every vector and is CPU-bound; call it
    /// from a blocking context (collection loading wraps this in
    /// `spawn_blocking`).
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, path)
    }

    /// Decode `SDXH` bytes; `origin` names the source in errors.
    pub fn from_bytes(bytes: &[u8], origin: &Path) -> Result<Self> {
        let mut reader = Cursor::new(bytes);

        let mut magic = [0_u8; 4];
        read_exact_or_corrupt(&mut reader, &mut magic, origin, "magic")?;
        if magic != HNSW_MAGIC {
            return Err(corrupt(
                origin,
                format!("invalid magic bytes: expected {HNSW_MAGIC:?}, found {magic:?}"),
            ));
        }
        let version = read_u16(&mut reader, origin, "version")?;
        if version != HNSW_FORMAT_VERSION {
            return Err(corrupt(origin, format!("unsupported SDXH version: {version}")));
        }

        let dimension = read_usize(&mut reader, origin, "dimension")?;
        let record_count = read_usize(&mut reader, origin, "record_count")?;
        let config = HnswConfig {
            m: read_usize(&mut reader, origin, "m")?,
            ef_construction: read_usize(&mut reader, origin, "ef_construction")?,
            ef_search: read_usize(&mut reader, origin, "ef_search")?,
            max_layer: read_usize(&mut reader, origin, "max_layer")?,
        };
        if record_count == 0 {
            return Err(corrupt(origin, "index file contains no records"));
        }
        if dimension == 0 {
            return Err(corrupt(origin, "index file declares zero dimension"));
        }
        // Bound both counts by what the file can actually hold before
        // they size any allocation. Every record carries at least a
        // hash_len field plus `dimension` f32 values.
        let remaining = (bytes.len() as u128).saturating_sub(u128::from(reader.position()));
        if (record_count as u128) * (4 + 4 * dimension as u128) > remaining {
            return Err(corrupt(
                origin,
                format!(
                    "header declares {record_count} records of dimension {dimension}, \
                     but only {remaining} bytes remain"
                ),
            ));
        }

        let mut hashes = Vec::with_capacity(record_count);
        let mut vectors = Vec::with_capacity(record_count);
        for _ in 0..record_count {
            let hash_len = read_usize(&mut reader, origin, "hash_len")?;
            if hash_len > bytes.len() {
                return Err(corrupt(origin, "hash length exceeds file size"));
            }
            let mut hash_bytes = vec![0_u8; hash_len];
            read_exact_or_corrupt(&mut reader, &mut hash_bytes, origin, "hash")?;
            let hash = String::from_utf8(hash_bytes)
                .map_err(|error| corrupt(origin, format!("invalid UTF-8 hash: {error}")))?;
            hashes.push(hash);

            let mut vector = Vec::with_capacity(dimension);
            for _ in 0..dimension {
                vector.push(read_f32(&mut reader, origin, "vector_value")?);
            }
            vectors.push(vector);
        }

        Self::build(hashes, vectors, config)
    }
}

fn validate_config(config: &HnswConfig) -> Result<()> {
    if config.m == 0 || config.m > 256 {
        return Err(VectorStoreError::InvalidParameter {
            field: "m",
            reason: format!("{} outside 1..=256", config.m),
        });
    }
    if config.ef_construction == 0 {
        return Err(VectorStoreError::InvalidParameter {
            field: "ef_construction",
            reason: "must be greater than zero".to_string(),
        });
    }
    if config.ef_search == 0 {
        return Err(VectorStoreError::InvalidParameter {
            field: "ef_search",
            reason: "must be greater than zero".to_string(),
        });
    }
    if config.max_layer == 0 {
        return Err(VectorStoreError::InvalidParameter {
            field: "max_layer",
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Scale to just under unit norm so `DistDot` stays within [0, 2].
fn normalize_for_dist_dot(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm > 0.0 {
        let inv_norm = DIST_DOT_SHRINK / norm;
        for value in &mut vector {
            *value *= inv_norm;
        }
    }
    vector
}

fn push_u32(out: &mut Vec<u8>, value: usize, field: &'static str) -> Result<()> {
    let value_u32 = u32::try_from(value).map_err(|_| VectorStoreError::InvalidParameter {
        field,
        reason: format!("{value} does not fit in u32"),
    })?;
    out.extend_from_slice(&value_u32.to_le_bytes());
    Ok(())
}

fn read_exact_or_corrupt<R: Read>(
    reader: &mut R,
    buffer: &mut [u8],
    origin: &Path,
    field: &str,
) -> Result<()> {
    reader.read_exact(buffer).map_err(|error| {
        if error.kind() == ErrorKind::UnexpectedEof {
            corrupt(origin, format!("unexpected EOF while reading {field}"))
        } else {
            VectorStoreError::IoError(error)
        }
    })
}

fn read_u16<R: Read>(reader: &mut R, origin: &Path, field: &str) -> Result<u16> {
    let mut bytes = [0_u8; 2];
    read_exact_or_corrupt(reader, &mut bytes, origin, field)?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_usize<R: Read>(reader: &mut R, origin: &Path, field: &str) -> Result<usize> {
    let mut bytes = [0_u8; 4];
    read_exact_or_corrupt(reader, &mut bytes, origin, field)?;
    usize::try_from(u32::from_le_bytes(bytes))
        .map_err(|_| corrupt(origin, format!("{field} does not fit in usize")))
}

fn read_f32<R: Read>(reader: &mut R, origin: &Path, field: &str) -> Result<f32> {
    let mut bytes = [0_u8; 4];
    read_exact_or_corrupt(reader, &mut bytes, origin, field)?;
    Ok(f32::from_le_bytes(bytes))
}

fn corrupt(origin: &Path, detail: impl Into<String>) -> VectorStoreError {
    VectorStoreError::CorruptIndex {
        path: origin.to_path_buf(),
        detail: detail.into(),
    }
}
