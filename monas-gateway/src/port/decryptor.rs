//! Decryptor trait - Abstract interface for the decryption primitive

use crate::domain::KeyRecord;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecryptError {
    #[error("malformed JWE: {0}")]
    Malformed(String),
    #[error("unsupported key management algorithm `{0}`")]
    UnsupportedAlgorithm(String),
    #[error("unsupported content encryption `{0}`")]
    UnsupportedEncryption(String),
    #[error("key `{key_id}` is for algorithm `{expected}`, but the JWE uses `{found}`")]
    AlgorithmMismatch {
        key_id: String,
        expected: String,
        found: String,
    },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("JWE authentication failed")]
    Authentication,
    #[error("failed to inflate JWE payload: {0}")]
    Inflate(String),
}

/// Turns a ciphertext envelope into plaintext using a key record's material.
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, key: &KeyRecord, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError>;
}
