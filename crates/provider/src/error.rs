use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("provider rate limited (retry_after: {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider network error: {0}")]
    Network(String),

    #[error("provider auth error: {0}")]
    Auth(String),

    #[error("provider returned invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}
