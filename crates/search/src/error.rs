use thiserror::Error;

pub type Result<T> = std::result::Result<T, SearchError>;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Provider error: {0}")]
    ProviderError(#[from] semdex_provider::ProviderError),

    #[error("Vector store error: {0}")]
    VectorStoreError(#[from] semdex_vector_store::VectorStoreError),

    #[error("Query is empty")]
    EmptyQuery,

    #[error("{0}")]
    Other(String),
}
