//! Retrieval pipeline: lookup, fetch, decompress, decrypt.

use std::sync::Arc;

use crate::domain::key_record::{CONTENT_ID_FIELD, MIME_FIELD};
use crate::domain::{Document, KeyRecord};
use crate::infrastructure::decompress::{decompress_if_gzip, DecompressError};
use crate::infrastructure::key_store::KeyStore;
use crate::port::content_fetcher::{ContentFetcher, FetchError};
use crate::port::decryptor::{DecryptError, Decryptor};

/// Coarse classification of a failed retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NotFound,
    MetadataMissing,
    FetchFailed,
    DecodeFailed,
}

/// Why a retrieval failed. The `Display` text is what clients see.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Key `{0}` not found.")]
    NotFound(String),
    #[error("Metadata key `{0}` not found.")]
    MetadataMissing(&'static str),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Decompress(#[from] DecompressError),
    #[error(transparent)]
    Decrypt(#[from] DecryptError),
}

impl RetrievalError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RetrievalError::NotFound(_) => FailureKind::NotFound,
            RetrievalError::MetadataMissing(_) => FailureKind::MetadataMissing,
            RetrievalError::Fetch(_) => FailureKind::FetchFailed,
            RetrievalError::Decompress(_) | RetrievalError::Decrypt(_) => FailureKind::DecodeFailed,
        }
    }
}

/// The single result of one retrieval attempt.
pub type RetrievalOutcome = Result<Document, RetrievalError>;

/// Resolves key IDs to decrypted documents.
///
/// Holds only shared, read-only state, so one instance serves every
/// connection concurrently.
pub struct RetrievalService<F, D> {
    key_store: Arc<KeyStore>,
    fetcher: F,
    decryptor: D,
}

impl<F, D> RetrievalService<F, D>
where
    F: ContentFetcher,
    D: Decryptor,
{
    pub fn new(key_store: Arc<KeyStore>, fetcher: F, decryptor: D) -> Self {
        Self {
            key_store,
            fetcher,
            decryptor,
        }
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    /// Run the whole pipeline for `key_id`, stopping at the first failure.
    pub async fn retrieve(&self, key_id: &str) -> RetrievalOutcome {
        let record = self
            .key_store
            .lookup(key_id)
            .ok_or_else(|| RetrievalError::NotFound(key_id.to_string()))?;

        self.retrieve_record(record).await
    }

    /// Run the pipeline from an already resolved record onward.
    pub async fn retrieve_record(&self, record: &KeyRecord) -> RetrievalOutcome {
        let metadata = record.metadata();
        let mime = metadata
            .mime()
            .ok_or(RetrievalError::MetadataMissing(MIME_FIELD))?;
        let content_id = metadata
            .content_id()
            .ok_or(RetrievalError::MetadataMissing(CONTENT_ID_FIELD))?;

        let fetched = self.fetcher.fetch(content_id).await?;
        tracing::debug!(
            "Fetched {} bytes for key `{}` from {}",
            fetched.len(),
            record.id(),
            content_id
        );

        let ciphertext = decompress_if_gzip(fetched)?;
        let body = self.decryptor.decrypt(record, &ciphertext)?;

        Ok(Document::new(mime, body))
    }
}
