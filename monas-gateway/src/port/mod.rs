//! Port layer - Abstract interfaces for the gateway's external collaborators
//!
//! The retrieval pipeline only talks to the content store and the
//! decryption primitive through these traits, so either can be swapped
//! (or mocked) without touching the pipeline.

pub mod content_fetcher;
pub mod decryptor;

pub use content_fetcher::{ContentFetcher, FetchError};
pub use decryptor::{DecryptError, Decryptor};
