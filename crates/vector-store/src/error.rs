use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VectorStoreError>;

#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Vector dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Corrupt index file {}: {detail}", path.display())]
    CorruptIndex { path: PathBuf, detail: String },

    #[error("Cannot build an index from zero vectors")]
    EmptyIndex,

    #[error("Invalid index parameter {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("Unknown content hash: {0}")]
    UnknownContent(String),

    #[error("{0}")]
    Other(String),
}
