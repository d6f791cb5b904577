//! Key records - a JSON Web Key plus the metadata the gateway needs to
//! locate and label the document it decrypts.

use serde_json::{Map, Value};
use std::fmt;

/// Metadata member declaring the plaintext's content type.
pub const MIME_FIELD: &str = "mime";

/// Metadata path locating the ciphertext in the content-addressed store.
pub const CONTENT_ID_FIELD: &str = "ipfs.cid";

const IPFS_MEMBER: &str = "ipfs";
const CID_MEMBER: &str = "cid";

/// Registered JWK members (RFC 7517 §4, RFC 7518 §6). Anything else on a
/// record is treated as metadata.
const JWK_MEMBERS: &[&str] = &[
    "kty", "use", "key_ops", "alg", "kid", "x5u", "x5c", "x5t", "x5t#S256", "crv", "x", "y", "d",
    "n", "e", "p", "q", "dp", "dq", "qi", "oth", "k",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyRecordError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("key record is not a JSON object")]
    NotAnObject,
    #[error("key record has no `kid`")]
    MissingKeyId,
    #[error("key record has no `kty`")]
    MissingKeyType,
}

/// A decryption key together with its declared metadata.
///
/// Records are immutable once parsed; the key store hands out shared
/// references only.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRecord {
    id: String,
    algorithm: Option<String>,
    material: KeyMaterial,
    metadata: KeyMetadata,
}

impl KeyRecord {
    /// Parse a single serialized JWK.
    pub fn from_json(bytes: &[u8]) -> Result<Self, KeyRecordError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| KeyRecordError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Split a JWK object into key material and metadata.
    pub fn from_value(value: Value) -> Result<Self, KeyRecordError> {
        let Value::Object(object) = value else {
            return Err(KeyRecordError::NotAnObject);
        };

        let id = object
            .get("kid")
            .and_then(Value::as_str)
            .ok_or(KeyRecordError::MissingKeyId)?
            .to_string();
        if object.get("kty").and_then(Value::as_str).is_none() {
            return Err(KeyRecordError::MissingKeyType);
        }
        let algorithm = object.get("alg").and_then(Value::as_str).map(str::to_string);

        let mut material = Map::new();
        let mut rest = Map::new();
        for (name, value) in object {
            if JWK_MEMBERS.contains(&name.as_str()) {
                material.insert(name, value);
            } else {
                rest.insert(name, value);
            }
        }

        Ok(Self {
            id,
            algorithm,
            material: KeyMaterial(material),
            metadata: KeyMetadata::from_members(rest),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The key management algorithm declared by the record (`alg`), if any.
    pub fn algorithm(&self) -> Option<&str> {
        self.algorithm.as_deref()
    }

    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }

    pub fn metadata(&self) -> &KeyMetadata {
        &self.metadata
    }
}

/// The registered JWK members of a record. Opaque to everything except
/// the decryptor.
#[derive(Clone, PartialEq)]
pub struct KeyMaterial(Map<String, Value>);

impl KeyMaterial {
    /// The JWK key type (`kty`). Always present on a parsed record.
    pub fn key_type(&self) -> &str {
        self.param("kty").unwrap_or_default()
    }

    /// A string-valued JWK parameter such as `k`, `crv` or `d`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }
}

// Private parameters must never reach the logs.
impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("kty", &self.key_type())
            .finish_non_exhaustive()
    }
}

/// Record metadata with the two fields the retrieval pipeline relies on
/// promoted to typed members.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyMetadata {
    mime: Option<String>,
    content_id: Option<String>,
    extra: Map<String, Value>,
}

impl KeyMetadata {
    pub fn new(mime: Option<String>, content_id: Option<String>) -> Self {
        Self {
            mime,
            content_id,
            extra: Map::new(),
        }
    }

    /// Promote `mime` and `ipfs.cid`; a member of the wrong JSON type
    /// counts as absent.
    fn from_members(mut members: Map<String, Value>) -> Self {
        let mime = members
            .remove(MIME_FIELD)
            .and_then(|v| v.as_str().map(str::to_string));
        let content_id = members
            .remove(IPFS_MEMBER)
            .as_ref()
            .and_then(|ipfs| ipfs.get(CID_MEMBER))
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            mime,
            content_id,
            extra: members,
        }
    }

    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    pub fn content_id(&self) -> Option<&str> {
        self.content_id.as_deref()
    }

    /// Non-standard members other than the promoted ones.
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }
}
