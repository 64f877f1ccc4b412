use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Provider error: {0}")]
    ProviderError(#[from] semdex_provider::ProviderError),

    #[error("Vector store error: {0}")]
    VectorStoreError(#[from] semdex_vector_store::VectorStoreError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Indexing already in progress: lease held by pid {holder_pid}, age {age_ms}ms")]
    AlreadyIndexing { holder_pid: u32, age_ms: u64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Corrupt metadata: {0}")]
    CorruptMetadata(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Invalid project path: {0}")]
    InvalidPath(String),

    #[error("{0}")]
    Other(String),
}
