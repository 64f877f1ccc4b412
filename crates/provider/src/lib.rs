//! # Semdex Provider
//!
//! Embedding-provider seam for semdex: the client trait the indexing engine
//! consumes, plus the adaptive plumbing that sits between the engine and any
//! real provider.
//!
//! ## Pipeline
//!
//! ```text
//! texts
//!     │
//!     ├──> RateLimiter (requests/min + tokens/min buckets)
//!     │      └─> client-side waits
//!     │
//!     ├──> EmbeddingGate (bounded retries, backoff)
//!     │      └─> EmbeddingProvider::get_embeddings_batch
//!     │
//!     └──> ThrottleMonitor (sliding window of wait / 429 events)
//!            └─> FullSpeed | ClientThrottled | ServerThrottled
//! ```

mod error;
mod gate;
mod provider;
mod rate_limit;
mod throttle;

pub use error::{ProviderError, Result};
pub use gate::{EmbeddingGate, RetryPolicy};
pub use provider::{estimate_batch_tokens, estimate_tokens, EmbeddingProvider};
pub use rate_limit::{RateLimiter, RateLimiterConfig};
pub use throttle::{ThrottleMonitor, ThrottleState, ThrottleStats};
