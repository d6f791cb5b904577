//! ContentFetcher trait - Abstract interface for the content-addressed store

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The content identifier cannot address anything in this store.
    #[error("invalid content ID `{content_id}`: {reason}")]
    InvalidContentId { content_id: String, reason: String },
    /// The store could not be reached or the transfer broke off.
    #[error("content store request failed: {0}")]
    Transport(String),
    /// The store answered, but with an error.
    #[error("content store error: {0}")]
    Store(String),
}

/// Retrieves raw blobs by content identifier.
///
/// Implementations must be safe to share across connections; the gateway
/// holds one instance for the life of the process.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Fetch the complete blob addressed by `content_id`.
    ///
    /// A single attempt is made; retries are the caller's business.
    async fn fetch(&self, content_id: &str) -> Result<Vec<u8>, FetchError>;
}
