use async_trait::async_trait;

use crate::error::Result;

/// A source of text embeddings.
///
/// Implementations wrap remote APIs or local models. The indexing
/// pipeline never talks to a provider directly: calls go through
/// [`crate::EmbeddingGate`], which budgets them against the rate
/// limiter and retries transient failures.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn get_embedding(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn get_embeddings_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Stable provider name for logs and health reports.
    fn get_provider_name(&self) -> &str;

    /// Model identifier currently in use.
    fn get_current_model(&self) -> &str;
}

/// Estimate the token count of a text without a real tokenizer.
///
/// Roughly one token per four characters, with a floor of one token
/// for any non-empty text. Empty text costs nothing.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    if chars == 0 {
        return 0;
    }
    (chars / 4).max(1)
}

/// Estimate the total token cost of a batch.
#[must_use]
pub fn estimate_batch_tokens(texts: &[String]) -> u64 {
    texts.iter().map(|t| estimate_tokens(t)).sum()
}
