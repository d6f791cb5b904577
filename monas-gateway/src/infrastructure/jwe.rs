//! JWE (RFC 7516) decryption.
//!
//! Supported key management algorithms (RFC 7518 §4):
//! - `dir`: the record's `oct` key is the content encryption key
//! - `A128KW`, `A192KW`, `A256KW`: AES key wrap with the record's `oct` key
//! - `ECDH-ES`: ephemeral-static ECDH on P-256, Concat KDF with SHA-256
//! - `ECDH-ES+A128KW`, `ECDH-ES+A192KW`, `ECDH-ES+A256KW`: ECDH-ES derived
//!   key used to unwrap the content encryption key
//! - `RSA-OAEP`, `RSA-OAEP-256`: RSAES-OAEP with SHA-1 or SHA-256
//!
//! Supported content encryption (RFC 7518 §5): `A128GCM`, `A192GCM`,
//! `A256GCM`, `A128CBC-HS256`, `A192CBC-HS384`, `A256CBC-HS512`.
//! Payloads carrying `"zip": "DEF"` are inflated after decryption.
//!
//! Both the compact serialization and the flattened JSON serialization are
//! accepted.

use std::io::Read;

use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use aes_kw::Kek;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use flate2::read::DeflateDecoder;
use hmac::{Hmac, Mac};
use p256::ecdh::diffie_hellman;
use p256::{PublicKey, SecretKey};
use rsa::{BigUint, Oaep, RsaPrivateKey};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::domain::{KeyMaterial, KeyRecord};
use crate::port::decryptor::{DecryptError, Decryptor};

pub(crate) type Aes192Gcm = AesGcm<Aes192, U12>;

const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const CBC_IV_LEN: usize = 16;
const AES_BLOCK_LEN: usize = 16;
const KEY_WRAP_OVERHEAD: usize = 8;
const P256_COORDINATE_LEN: usize = 32;

/// Decrypts JWE documents with the key material of a JWK record.
#[derive(Debug, Default, Clone, Copy)]
pub struct JweDecryptor;

impl Decryptor for JweDecryptor {
    fn decrypt(&self, key: &KeyRecord, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        let jwe = JweParts::parse(ciphertext)?;
        let alg = jwe.header.alg.as_str();

        if let Some(expected) = key.algorithm() {
            if expected != alg {
                return Err(DecryptError::AlgorithmMismatch {
                    key_id: key.id().to_string(),
                    expected: expected.to_string(),
                    found: alg.to_string(),
                });
            }
        }

        let management = KeyManagement::from_name(alg)?;
        let enc = ContentEncryption::from_name(&jwe.header.enc)?;
        match (management.wraps_key(), jwe.encrypted_key.is_empty()) {
            (true, true) => {
                return Err(DecryptError::Malformed(format!(
                    "`{alg}` needs an encrypted key"
                )))
            }
            (false, false) => {
                return Err(DecryptError::Malformed(format!(
                    "`{alg}` must not carry an encrypted key"
                )))
            }
            _ => {}
        }

        let material = key.material();
        let cek = match management {
            KeyManagement::Direct => symmetric_key(material, alg)?,
            KeyManagement::AesKeyWrap { kek_len } => {
                let kek = symmetric_key(material, alg)?;
                if kek.len() != kek_len {
                    return Err(DecryptError::InvalidKey(format!(
                        "`{alg}` needs a {kek_len}-byte key, got {} bytes",
                        kek.len()
                    )));
                }
                aes_key_unwrap(&kek, &jwe.encrypted_key)?
            }
            KeyManagement::EcdhEs => {
                ecdh_es_agreement(material, &jwe.header, enc.name(), enc.key_len())?
            }
            KeyManagement::EcdhEsKeyWrap { kek_len } => {
                let kek = ecdh_es_agreement(material, &jwe.header, alg, kek_len)?;
                aes_key_unwrap(&kek, &jwe.encrypted_key)?
            }
            KeyManagement::RsaOaep => {
                rsa_oaep_unwrap(material, Oaep::new::<Sha1>(), &jwe.encrypted_key)?
            }
            KeyManagement::RsaOaep256 => {
                rsa_oaep_unwrap(material, Oaep::new::<Sha256>(), &jwe.encrypted_key)?
            }
        };

        let plaintext = enc.open(&cek, &jwe.iv, &jwe.ciphertext, &jwe.tag, &jwe.aad)?;

        match jwe.header.zip.as_deref() {
            None => Ok(plaintext),
            Some("DEF") => inflate(&plaintext),
            Some(other) => Err(DecryptError::Inflate(format!(
                "unsupported compression `{other}`"
            ))),
        }
    }
}

/// JWE key management algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyManagement {
    Direct,
    AesKeyWrap { kek_len: usize },
    EcdhEs,
    EcdhEsKeyWrap { kek_len: usize },
    RsaOaep,
    RsaOaep256,
}

impl KeyManagement {
    fn from_name(name: &str) -> Result<Self, DecryptError> {
        match name {
            "dir" => Ok(Self::Direct),
            "A128KW" => Ok(Self::AesKeyWrap { kek_len: 16 }),
            "A192KW" => Ok(Self::AesKeyWrap { kek_len: 24 }),
            "A256KW" => Ok(Self::AesKeyWrap { kek_len: 32 }),
            "ECDH-ES" => Ok(Self::EcdhEs),
            "ECDH-ES+A128KW" => Ok(Self::EcdhEsKeyWrap { kek_len: 16 }),
            "ECDH-ES+A192KW" => Ok(Self::EcdhEsKeyWrap { kek_len: 24 }),
            "ECDH-ES+A256KW" => Ok(Self::EcdhEsKeyWrap { kek_len: 32 }),
            "RSA-OAEP" => Ok(Self::RsaOaep),
            "RSA-OAEP-256" => Ok(Self::RsaOaep256),
            other => Err(DecryptError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    /// Whether the JWE carries the content encryption key in wrapped form.
    fn wraps_key(self) -> bool {
        !matches!(self, Self::Direct | Self::EcdhEs)
    }
}

#[derive(Debug, Deserialize)]
struct JoseHeader {
    alg: String,
    enc: String,
    #[serde(default)]
    zip: Option<String>,
    #[serde(default)]
    epk: Option<EphemeralKey>,
    #[serde(default)]
    apu: Option<String>,
    #[serde(default)]
    apv: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EphemeralKey {
    kty: String,
    crv: String,
    x: String,
    y: String,
}

#[derive(Debug, Deserialize)]
struct FlattenedJwe {
    protected: String,
    #[serde(default)]
    unprotected: Option<Map<String, Value>>,
    #[serde(default)]
    header: Option<Map<String, Value>>,
    #[serde(default)]
    encrypted_key: Option<String>,
    iv: String,
    ciphertext: String,
    tag: String,
    #[serde(default)]
    aad: Option<String>,
}

/// A JWE split into its decoded parts.
struct JweParts {
    header: JoseHeader,
    encrypted_key: Vec<u8>,
    iv: Vec<u8>,
    ciphertext: Vec<u8>,
    tag: Vec<u8>,
    /// Additional authenticated data, exactly as the sender computed it.
    aad: Vec<u8>,
}

impl JweParts {
    fn parse(input: &[u8]) -> Result<Self, DecryptError> {
        let text = std::str::from_utf8(input)
            .map_err(|_| DecryptError::Malformed("JWE is not valid UTF-8".into()))?
            .trim();

        if text.starts_with('{') {
            Self::parse_flattened(text)
        } else {
            Self::parse_compact(text)
        }
    }

    fn parse_compact(text: &str) -> Result<Self, DecryptError> {
        let segments: Vec<&str> = text.split('.').collect();
        let [protected, encrypted_key, iv, ciphertext, tag] = segments.as_slice() else {
            return Err(DecryptError::Malformed(format!(
                "expected 5 segments, found {}",
                segments.len()
            )));
        };

        let header = decode_header(protected, None)?;
        Ok(Self {
            header,
            encrypted_key: decode_segment("encrypted key", encrypted_key)?,
            iv: decode_segment("iv", iv)?,
            ciphertext: decode_segment("ciphertext", ciphertext)?,
            tag: decode_segment("tag", tag)?,
            aad: protected.as_bytes().to_vec(),
        })
    }

    fn parse_flattened(text: &str) -> Result<Self, DecryptError> {
        let jwe: FlattenedJwe = serde_json::from_str(text)
            .map_err(|e| DecryptError::Malformed(format!("invalid JSON serialization: {e}")))?;

        let mut shared = jwe.unprotected.unwrap_or_default();
        for (name, value) in jwe.header.unwrap_or_default() {
            if shared.contains_key(&name) {
                return Err(DecryptError::Malformed(format!(
                    "header parameter `{name}` is both shared and per-recipient"
                )));
            }
            shared.insert(name, value);
        }
        let header = decode_header(&jwe.protected, Some(shared))?;

        let mut aad = jwe.protected.into_bytes();
        if let Some(extra) = &jwe.aad {
            aad.push(b'.');
            aad.extend_from_slice(extra.as_bytes());
        }

        Ok(Self {
            header,
            encrypted_key: decode_segment(
                "encrypted key",
                jwe.encrypted_key.as_deref().unwrap_or_default(),
            )?,
            iv: decode_segment("iv", &jwe.iv)?,
            ciphertext: decode_segment("ciphertext", &jwe.ciphertext)?,
            tag: decode_segment("tag", &jwe.tag)?,
            aad,
        })
    }
}

/// Decode the protected header, merging any unprotected members underneath.
fn decode_header(
    protected: &str,
    unprotected: Option<Map<String, Value>>,
) -> Result<JoseHeader, DecryptError> {
    let raw = decode_segment("protected header", protected)?;
    let protected: Map<String, Value> = serde_json::from_slice(&raw)
        .map_err(|e| DecryptError::Malformed(format!("invalid protected header: {e}")))?;

    let mut members = unprotected.unwrap_or_default();
    for (name, value) in protected {
        if members.contains_key(&name) {
            return Err(DecryptError::Malformed(format!(
                "header parameter `{name}` is both protected and unprotected"
            )));
        }
        members.insert(name, value);
    }

    serde_json::from_value(Value::Object(members))
        .map_err(|e| DecryptError::Malformed(format!("invalid JOSE header: {e}")))
}

fn decode_segment(name: &str, segment: &str) -> Result<Vec<u8>, DecryptError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| DecryptError::Malformed(format!("{name} is not base64url: {e}")))
}

fn key_param(material: &KeyMaterial, name: &str) -> Result<Vec<u8>, DecryptError> {
    let value = material
        .param(name)
        .ok_or_else(|| DecryptError::InvalidKey(format!("missing `{name}` parameter")))?;
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| DecryptError::InvalidKey(format!("`{name}` is not base64url: {e}")))
}

fn symmetric_key(material: &KeyMaterial, alg: &str) -> Result<Vec<u8>, DecryptError> {
    if material.key_type() != "oct" {
        return Err(DecryptError::InvalidKey(format!(
            "`{alg}` needs an `oct` key, not `{}`",
            material.key_type()
        )));
    }
    key_param(material, "k")
}

/// RFC 3394 key unwrap. A failed integrity check means the wrong key.
fn aes_key_unwrap(kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>, DecryptError> {
    if wrapped.len() < 3 * KEY_WRAP_OVERHEAD || wrapped.len() % KEY_WRAP_OVERHEAD != 0 {
        return Err(DecryptError::Malformed(format!(
            "encrypted key of {} bytes is not AES key wrap output",
            wrapped.len()
        )));
    }

    let mut cek = vec![0u8; wrapped.len() - KEY_WRAP_OVERHEAD];
    let unwrapped = match kek.len() {
        16 => Kek::<Aes128>::new(GenericArray::from_slice(kek)).unwrap(wrapped, &mut cek),
        24 => Kek::<Aes192>::new(GenericArray::from_slice(kek)).unwrap(wrapped, &mut cek),
        32 => Kek::<Aes256>::new(GenericArray::from_slice(kek)).unwrap(wrapped, &mut cek),
        other => {
            return Err(DecryptError::InvalidKey(format!(
                "no AES key wrap with a {other}-byte key"
            )))
        }
    };
    unwrapped.map_err(|_| DecryptError::Authentication)?;
    Ok(cek)
}

/// ECDH-ES agreement followed by the Concat KDF, producing `key_len` bytes
/// bound to `algorithm_id`.
fn ecdh_es_agreement(
    material: &KeyMaterial,
    header: &JoseHeader,
    algorithm_id: &str,
    key_len: usize,
) -> Result<Vec<u8>, DecryptError> {
    if material.key_type() != "EC" || material.param("crv") != Some("P-256") {
        return Err(DecryptError::InvalidKey(format!(
            "`{}` needs an EC P-256 key",
            header.alg
        )));
    }
    let secret = SecretKey::from_slice(&key_param(material, "d")?)
        .map_err(|_| DecryptError::InvalidKey("`d` is not a P-256 scalar".into()))?;

    let epk = header.epk.as_ref().ok_or_else(|| {
        DecryptError::Malformed(format!("`{}` header has no `epk`", header.alg))
    })?;
    let ephemeral = ephemeral_public_key(epk)?;

    let shared = diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
    let party_u = decode_optional("apu", header.apu.as_deref())?;
    let party_v = decode_optional("apv", header.apv.as_deref())?;

    Ok(concat_kdf(
        shared.raw_secret_bytes().as_slice(),
        algorithm_id,
        &party_u,
        &party_v,
        key_len,
    ))
}

fn ephemeral_public_key(epk: &EphemeralKey) -> Result<PublicKey, DecryptError> {
    if epk.kty != "EC" || epk.crv != "P-256" {
        return Err(DecryptError::Malformed(format!(
            "unsupported ephemeral key `{}`/`{}`",
            epk.kty, epk.crv
        )));
    }
    let x = decode_segment("epk.x", &epk.x)?;
    let y = decode_segment("epk.y", &epk.y)?;
    if x.len() != P256_COORDINATE_LEN || y.len() != P256_COORDINATE_LEN {
        return Err(DecryptError::Malformed(
            "ephemeral key coordinates must be 32 bytes".into(),
        ));
    }

    let mut sec1 = Vec::with_capacity(1 + 2 * P256_COORDINATE_LEN);
    sec1.push(0x04);
    sec1.extend_from_slice(&x);
    sec1.extend_from_slice(&y);
    PublicKey::from_sec1_bytes(&sec1)
        .map_err(|_| DecryptError::Malformed("ephemeral key is not on P-256".into()))
}

fn decode_optional(name: &str, value: Option<&str>) -> Result<Vec<u8>, DecryptError> {
    value.map_or(Ok(Vec::new()), |v| decode_segment(name, v))
}

/// Concat KDF (NIST SP 800-56A §5.8.1) as profiled by RFC 7518 §4.6.2.
pub fn concat_kdf(
    shared_secret: &[u8],
    algorithm_id: &str,
    party_u: &[u8],
    party_v: &[u8],
    key_len: usize,
) -> Vec<u8> {
    let mut other_info = Vec::new();
    for field in [algorithm_id.as_bytes(), party_u, party_v] {
        other_info.extend_from_slice(&(field.len() as u32).to_be_bytes());
        other_info.extend_from_slice(field);
    }
    other_info.extend_from_slice(&((key_len * 8) as u32).to_be_bytes());

    let mut derived = Vec::with_capacity(key_len);
    let mut counter: u32 = 1;
    while derived.len() < key_len {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(shared_secret);
        hasher.update(&other_info);
        derived.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    derived.truncate(key_len);
    derived
}

fn rsa_private_key(material: &KeyMaterial) -> Result<RsaPrivateKey, DecryptError> {
    if material.key_type() != "RSA" {
        return Err(DecryptError::InvalidKey(format!(
            "RSA-OAEP needs an `RSA` key, not `{}`",
            material.key_type()
        )));
    }
    let integer =
        |name: &str| key_param(material, name).map(|bytes| BigUint::from_bytes_be(&bytes));

    // Without both primes the factors are recovered from `n`, `e` and `d`.
    let primes = match (material.param("p"), material.param("q")) {
        (Some(_), Some(_)) => vec![integer("p")?, integer("q")?],
        _ => Vec::new(),
    };
    RsaPrivateKey::from_components(integer("n")?, integer("e")?, integer("d")?, primes)
        .map_err(|e| DecryptError::InvalidKey(format!("invalid RSA key: {e}")))
}

fn rsa_oaep_unwrap(
    material: &KeyMaterial,
    padding: Oaep,
    encrypted_key: &[u8],
) -> Result<Vec<u8>, DecryptError> {
    rsa_private_key(material)?
        .decrypt(padding, encrypted_key)
        .map_err(|_| DecryptError::Authentication)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, DecryptError> {
    let mut inflated = Vec::new();
    DeflateDecoder::new(data)
        .read_to_end(&mut inflated)
        .map_err(|e| DecryptError::Inflate(e.to_string()))?;
    Ok(inflated)
}

/// JWE content encryption algorithms (RFC 7518 §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncryption {
    A128Gcm,
    A192Gcm,
    A256Gcm,
    A128CbcHs256,
    A192CbcHs384,
    A256CbcHs512,
}

impl ContentEncryption {
    pub fn from_name(name: &str) -> Result<Self, DecryptError> {
        match name {
            "A128GCM" => Ok(Self::A128Gcm),
            "A192GCM" => Ok(Self::A192Gcm),
            "A256GCM" => Ok(Self::A256Gcm),
            "A128CBC-HS256" => Ok(Self::A128CbcHs256),
            "A192CBC-HS384" => Ok(Self::A192CbcHs384),
            "A256CBC-HS512" => Ok(Self::A256CbcHs512),
            other => Err(DecryptError::UnsupportedEncryption(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::A128Gcm => "A128GCM",
            Self::A192Gcm => "A192GCM",
            Self::A256Gcm => "A256GCM",
            Self::A128CbcHs256 => "A128CBC-HS256",
            Self::A192CbcHs384 => "A192CBC-HS384",
            Self::A256CbcHs512 => "A256CBC-HS512",
        }
    }

    /// Content encryption key length in bytes. For the CBC-HMAC family the
    /// first half is the MAC key and the second half the AES key.
    pub fn key_len(self) -> usize {
        match self {
            Self::A128Gcm => 16,
            Self::A192Gcm => 24,
            Self::A256Gcm | Self::A128CbcHs256 => 32,
            Self::A192CbcHs384 => 48,
            Self::A256CbcHs512 => 64,
        }
    }

    pub fn iv_len(self) -> usize {
        if self.is_gcm() {
            GCM_IV_LEN
        } else {
            CBC_IV_LEN
        }
    }

    /// Authentication tag length in bytes.
    pub fn tag_len(self) -> usize {
        if self.is_gcm() {
            GCM_TAG_LEN
        } else {
            self.key_len() / 2
        }
    }

    fn is_gcm(self) -> bool {
        matches!(self, Self::A128Gcm | Self::A192Gcm | Self::A256Gcm)
    }

    fn open(
        self,
        cek: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, DecryptError> {
        if cek.len() != self.key_len() {
            return Err(DecryptError::InvalidKey(format!(
                "{} needs a {}-byte key, got {} bytes",
                self.name(),
                self.key_len(),
                cek.len()
            )));
        }
        if iv.len() != self.iv_len() {
            return Err(DecryptError::Malformed(format!(
                "iv must be {} bytes, got {}",
                self.iv_len(),
                iv.len()
            )));
        }
        if tag.len() != self.tag_len() {
            return Err(DecryptError::Malformed(format!(
                "tag must be {} bytes, got {}",
                self.tag_len(),
                tag.len()
            )));
        }

        match self {
            Self::A128Gcm => open_gcm::<Aes128Gcm>(cek, iv, ciphertext, tag, aad),
            Self::A192Gcm => open_gcm::<Aes192Gcm>(cek, iv, ciphertext, tag, aad),
            Self::A256Gcm => open_gcm::<Aes256Gcm>(cek, iv, ciphertext, tag, aad),
            Self::A128CbcHs256 => open_cbc_hmac::<Hmac<Sha256>, cbc::Decryptor<Aes128>>(
                cek, iv, ciphertext, tag, aad,
            ),
            Self::A192CbcHs384 => open_cbc_hmac::<Hmac<Sha384>, cbc::Decryptor<Aes192>>(
                cek, iv, ciphertext, tag, aad,
            ),
            Self::A256CbcHs512 => open_cbc_hmac::<Hmac<Sha512>, cbc::Decryptor<Aes256>>(
                cek, iv, ciphertext, tag, aad,
            ),
        }
    }
}

fn open_gcm<C>(
    cek: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, DecryptError>
where
    C: KeyInit + Aead + AeadCore<NonceSize = U12>,
{
    let mut sealed = Vec::with_capacity(ciphertext.len() + tag.len());
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    let cipher = C::new_from_slice(cek).map_err(|_| DecryptError::InvalidKey("bad CEK".into()))?;
    cipher
        .decrypt(GenericArray::from_slice(iv), Payload { msg: &sealed, aad })
        .map_err(|_| DecryptError::Authentication)
}

/// AES-CBC with HMAC-SHA2 (RFC 7518 §5.2.2). The tag is checked before
/// anything is decrypted.
fn open_cbc_hmac<M, D>(
    cek: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, DecryptError>
where
    M: Mac + KeyInit,
    D: KeyIvInit + BlockDecryptMut,
{
    let (mac_key, enc_key) = cek.split_at(cek.len() / 2);

    let mut mac = <M as KeyInit>::new_from_slice(mac_key)
        .map_err(|_| DecryptError::InvalidKey("bad MAC key".into()))?;
    let aad_bits = (aad.len() as u64 * 8).to_be_bytes();
    for part in [aad, iv, ciphertext, aad_bits.as_slice()] {
        Mac::update(&mut mac, part);
    }
    mac.verify_truncated_left(tag)
        .map_err(|_| DecryptError::Authentication)?;

    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_LEN != 0 {
        return Err(DecryptError::Malformed(
            "ciphertext is not a whole number of AES blocks".into(),
        ));
    }
    D::new_from_slices(enc_key, iv)
        .map_err(|_| DecryptError::InvalidKey("bad AES key".into()))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| DecryptError::Malformed("invalid CBC padding".into()))
}
