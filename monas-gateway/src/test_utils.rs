//! Test utilities and mock implementations for unit testing.
//!
//! This module provides mock implementations of the port traits plus
//! fixture builders (JWKs, JWE ciphertext, gzip blobs) so that tests can
//! exercise the gateway without a running IPFS daemon.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use aes_kw::Kek;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use hmac::{Hmac, Mac};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use tokio::sync::Mutex;

use crate::domain::KeyRecord;
use crate::infrastructure::jwe::{concat_kdf, Aes192Gcm, ContentEncryption};
use crate::port::content_fetcher::{ContentFetcher, FetchError};
use crate::port::decryptor::{DecryptError, Decryptor};

/// IVs used by every JWE fixture. Fixtures are never reused across keys.
const FIXTURE_GCM_IV: [u8; 12] = [7; 12];
const FIXTURE_CBC_IV: [u8; 16] = [9; 16];

// ============================================================================
// MockContentFetcher
// ============================================================================

/// Mock implementation of ContentFetcher for testing.
#[derive(Clone, Default)]
pub struct MockContentFetcher {
    pub content: Arc<HashMap<String, Result<Vec<u8>, FetchError>>>,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl MockContentFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(self, content_id: &str, data: Vec<u8>) -> Self {
        self.with_entry(content_id, Ok(data))
    }

    pub fn with_error(self, content_id: &str, error: FetchError) -> Self {
        self.with_entry(content_id, Err(error))
    }

    fn with_entry(self, content_id: &str, entry: Result<Vec<u8>, FetchError>) -> Self {
        let mut content = (*self.content).clone();
        content.insert(content_id.to_string(), entry);
        Self {
            content: Arc::new(content),
            ..self
        }
    }

    /// Content IDs requested so far, in order.
    pub async fn requests(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl ContentFetcher for MockContentFetcher {
    async fn fetch(&self, content_id: &str) -> Result<Vec<u8>, FetchError> {
        self.requests.lock().await.push(content_id.to_string());
        self.content
            .get(content_id)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::Store(format!("{content_id}: not found"))))
    }
}

// ============================================================================
// MockDecryptor
// ============================================================================

/// Mock implementation of Decryptor mapping known ciphertexts to plaintexts.
///
/// Unknown ciphertexts fail the way a wrong key would.
#[derive(Clone, Default)]
pub struct MockDecryptor {
    pub plaintexts: Arc<HashMap<Vec<u8>, Vec<u8>>>,
    pub invocations: Arc<AtomicUsize>,
}

impl MockDecryptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plaintext(self, ciphertext: &[u8], plaintext: &[u8]) -> Self {
        let mut plaintexts = (*self.plaintexts).clone();
        plaintexts.insert(ciphertext.to_vec(), plaintext.to_vec());
        Self {
            plaintexts: Arc::new(plaintexts),
            ..self
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Decryptor for MockDecryptor {
    fn decrypt(&self, _key: &KeyRecord, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.plaintexts
            .get(ciphertext)
            .cloned()
            .ok_or(DecryptError::Authentication)
    }
}

// ============================================================================
// Key fixtures
// ============================================================================

/// A symmetric (`oct`) JWK.
pub fn oct_jwk(kid: &str, key: &[u8]) -> Value {
    json!({
        "kty": "oct",
        "kid": kid,
        "k": URL_SAFE_NO_PAD.encode(key),
    })
}

/// An EC P-256 private JWK.
pub fn ec_jwk(kid: &str, secret: &SecretKey) -> Value {
    let point = secret.public_key().to_encoded_point(false);
    let x = point.x().expect("uncompressed point has x");
    let y = point.y().expect("uncompressed point has y");
    json!({
        "kty": "EC",
        "crv": "P-256",
        "kid": kid,
        "x": URL_SAFE_NO_PAD.encode(x),
        "y": URL_SAFE_NO_PAD.encode(y),
        "d": URL_SAFE_NO_PAD.encode(secret.to_bytes()),
    })
}

/// An RSA private JWK including both primes.
pub fn rsa_jwk(kid: &str, key: &RsaPrivateKey) -> Value {
    let primes = key.primes();
    json!({
        "kty": "RSA",
        "kid": kid,
        "n": URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
        "e": URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
        "d": URL_SAFE_NO_PAD.encode(key.d().to_bytes_be()),
        "p": URL_SAFE_NO_PAD.encode(primes[0].to_bytes_be()),
        "q": URL_SAFE_NO_PAD.encode(primes[1].to_bytes_be()),
    })
}

/// A 1024-bit RSA key generated once per test process from a fixed seed.
///
/// OAEP with SHA-256 can carry at most 62 bytes under this key, so it is
/// only paired with content keys of 32 bytes or less.
pub fn rsa_test_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        RsaPrivateKey::new(&mut rng, 1024).expect("RSA key generation")
    })
}

/// Attach document metadata (`mime`, `ipfs.cid`) to a JWK.
pub fn with_document(mut jwk: Value, mime: Option<&str>, content_id: Option<&str>) -> Value {
    if let Some(mime) = mime {
        jwk["mime"] = json!(mime);
    }
    if let Some(content_id) = content_id {
        jwk["ipfs"] = json!({ "cid": content_id });
    }
    jwk
}

pub fn with_algorithm(mut jwk: Value, alg: &str) -> Value {
    jwk["alg"] = json!(alg);
    jwk
}

pub fn key_record(jwk: Value) -> KeyRecord {
    KeyRecord::from_value(jwk).expect("fixture JWK is valid")
}

pub fn oct_key_record(kid: &str, key: &[u8], alg: Option<&str>) -> KeyRecord {
    let jwk = oct_jwk(kid, key);
    key_record(match alg {
        Some(alg) => with_algorithm(jwk, alg),
        None => jwk,
    })
}

pub fn ec_key_record(kid: &str, secret: &SecretKey, alg: Option<&str>) -> KeyRecord {
    let jwk = ec_jwk(kid, secret);
    key_record(match alg {
        Some(alg) => with_algorithm(jwk, alg),
        None => jwk,
    })
}

/// An `oct` record with a throwaway key and the given metadata.
pub fn oct_key_record_with_metadata(
    kid: &str,
    mime: Option<&str>,
    content_id: Option<&str>,
) -> KeyRecord {
    key_record(with_document(oct_jwk(kid, &[0; 32]), mime, content_id))
}

pub fn bare_key_record(kid: &str) -> KeyRecord {
    oct_key_record_with_metadata(kid, None, None)
}

// ============================================================================
// Ciphertext fixtures
// ============================================================================

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("writing to a Vec cannot fail");
    encoder.finish().expect("writing to a Vec cannot fail")
}

/// Raw DEFLATE, as used by `"zip": "DEF"`.
pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("writing to a Vec cannot fail");
    encoder.finish().expect("writing to a Vec cannot fail")
}

/// Compact JWE using `dir` key management.
pub fn encrypt_dir(cek: &[u8], enc: &str, plaintext: &[u8]) -> String {
    let header = json!({ "alg": "dir", "enc": enc });
    encrypt_compact(&header, cek, &[], plaintext)
}

/// Compact JWE whose content key is wrapped with `A128KW`, `A192KW` or
/// `A256KW`, picked from the length of `kek`.
pub fn encrypt_aes_kw(kek: &[u8], enc: &str, cek: &[u8], plaintext: &[u8]) -> String {
    let header = json!({ "alg": format!("A{}KW", kek.len() * 8), "enc": enc });
    encrypt_compact(&header, cek, &aes_key_wrap(kek, cek), plaintext)
}

/// Compact JWE using `ECDH-ES` with a caller-chosen ephemeral key.
pub fn encrypt_ecdh_es(
    recipient: &PublicKey,
    ephemeral: &SecretKey,
    enc: &str,
    plaintext: &[u8],
) -> String {
    let key_len = ContentEncryption::from_name(enc)
        .expect("supported enc")
        .key_len();
    let cek = ecdh_es_key(recipient, ephemeral, enc, key_len);

    let header = json!({ "alg": "ECDH-ES", "enc": enc, "epk": epk(ephemeral) });
    encrypt_compact(&header, &cek, &[], plaintext)
}

/// Compact JWE using `ECDH-ES+A128KW` and friends: the agreed key wraps
/// `cek`.
pub fn encrypt_ecdh_es_kw(
    recipient: &PublicKey,
    ephemeral: &SecretKey,
    alg: &str,
    enc: &str,
    cek: &[u8],
    plaintext: &[u8],
) -> String {
    let kek_len = match alg {
        "ECDH-ES+A128KW" => 16,
        "ECDH-ES+A192KW" => 24,
        "ECDH-ES+A256KW" => 32,
        other => panic!("`{other}` is not an ECDH-ES key wrap algorithm"),
    };
    let kek = ecdh_es_key(recipient, ephemeral, alg, kek_len);

    let header = json!({ "alg": alg, "enc": enc, "epk": epk(ephemeral) });
    encrypt_compact(&header, cek, &aes_key_wrap(&kek, cek), plaintext)
}

/// Compact JWE using `RSA-OAEP` or `RSA-OAEP-256`.
pub fn encrypt_rsa_oaep(
    recipient: &RsaPublicKey,
    alg: &str,
    enc: &str,
    cek: &[u8],
    plaintext: &[u8],
) -> String {
    let padding = match alg {
        "RSA-OAEP" => Oaep::new::<Sha1>(),
        "RSA-OAEP-256" => Oaep::new::<Sha256>(),
        other => panic!("`{other}` is not an RSA-OAEP algorithm"),
    };
    let mut rng = StdRng::seed_from_u64(7);
    let encrypted_key = recipient
        .encrypt(&mut rng, padding, cek)
        .expect("RSA-OAEP encryption");

    let header = json!({ "alg": alg, "enc": enc });
    encrypt_compact(&header, cek, &encrypted_key, plaintext)
}

/// Compact JWE with an arbitrary protected header. `header["enc"]` selects
/// the content encryption; `plaintext` is sealed as given.
pub fn encrypt_compact(
    header: &Value,
    cek: &[u8],
    encrypted_key: &[u8],
    plaintext: &[u8],
) -> String {
    let enc = header["enc"].as_str().expect("fixture header has `enc`");
    let protected = URL_SAFE_NO_PAD.encode(header.to_string());
    let aad = protected.as_bytes();

    let (iv, ciphertext, tag) = match ContentEncryption::from_name(enc).expect("supported enc") {
        ContentEncryption::A128Gcm => seal_gcm::<Aes128Gcm>(cek, aad, plaintext),
        ContentEncryption::A192Gcm => seal_gcm::<Aes192Gcm>(cek, aad, plaintext),
        ContentEncryption::A256Gcm => seal_gcm::<Aes256Gcm>(cek, aad, plaintext),
        ContentEncryption::A128CbcHs256 => {
            seal_cbc_hmac::<Hmac<Sha256>, cbc::Encryptor<Aes128>>(cek, aad, plaintext)
        }
        ContentEncryption::A192CbcHs384 => {
            seal_cbc_hmac::<Hmac<Sha384>, cbc::Encryptor<Aes192>>(cek, aad, plaintext)
        }
        ContentEncryption::A256CbcHs512 => {
            seal_cbc_hmac::<Hmac<Sha512>, cbc::Encryptor<Aes256>>(cek, aad, plaintext)
        }
    };

    format!(
        "{}.{}.{}.{}.{}",
        protected,
        URL_SAFE_NO_PAD.encode(encrypted_key),
        URL_SAFE_NO_PAD.encode(iv),
        URL_SAFE_NO_PAD.encode(ciphertext),
        URL_SAFE_NO_PAD.encode(tag)
    )
}

/// RFC 3394 key wrap under a 16, 24 or 32-byte `kek`.
pub fn aes_key_wrap(kek: &[u8], cek: &[u8]) -> Vec<u8> {
    let mut wrapped = vec![0u8; cek.len() + 8];
    match kek.len() {
        16 => Kek::<Aes128>::new(GenericArray::from_slice(kek)).wrap(cek, &mut wrapped),
        24 => Kek::<Aes192>::new(GenericArray::from_slice(kek)).wrap(cek, &mut wrapped),
        32 => Kek::<Aes256>::new(GenericArray::from_slice(kek)).wrap(cek, &mut wrapped),
        other => panic!("no AES key wrap with a {other}-byte key"),
    }
    .expect("AES key wrap");
    wrapped
}

fn ecdh_es_key(
    recipient: &PublicKey,
    ephemeral: &SecretKey,
    algorithm_id: &str,
    key_len: usize,
) -> Vec<u8> {
    let shared = diffie_hellman(ephemeral.to_nonzero_scalar(), recipient.as_affine());
    concat_kdf(
        shared.raw_secret_bytes().as_slice(),
        algorithm_id,
        &[],
        &[],
        key_len,
    )
}

fn epk(ephemeral: &SecretKey) -> Value {
    let jwk = ec_jwk("", ephemeral);
    json!({ "kty": "EC", "crv": "P-256", "x": jwk["x"], "y": jwk["y"] })
}

fn seal_gcm<C>(cek: &[u8], aad: &[u8], plaintext: &[u8]) -> (Vec<u8>, Vec<u8>, Vec<u8>)
where
    C: KeyInit + Aead + AeadCore<NonceSize = U12>,
{
    let sealed = C::new_from_slice(cek)
        .expect("CEK size matches enc")
        .encrypt(
            GenericArray::from_slice(&FIXTURE_GCM_IV),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .expect("AES-GCM encryption");

    let (ciphertext, tag) = sealed.split_at(sealed.len() - 16);
    (FIXTURE_GCM_IV.to_vec(), ciphertext.to_vec(), tag.to_vec())
}

fn seal_cbc_hmac<M, E>(cek: &[u8], aad: &[u8], plaintext: &[u8]) -> (Vec<u8>, Vec<u8>, Vec<u8>)
where
    M: Mac + KeyInit,
    E: KeyIvInit + BlockEncryptMut,
{
    let (mac_key, enc_key) = cek.split_at(cek.len() / 2);
    let ciphertext = E::new_from_slices(enc_key, &FIXTURE_CBC_IV)
        .expect("CEK size matches enc")
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut mac = <M as KeyInit>::new_from_slice(mac_key).expect("HMAC accepts any key");
    let aad_bits = (aad.len() as u64 * 8).to_be_bytes();
    for part in [aad, FIXTURE_CBC_IV.as_slice(), ciphertext.as_slice(), aad_bits.as_slice()] {
        Mac::update(&mut mac, part);
    }
    let tag = mac.finalize().into_bytes()[..mac_key.len()].to_vec();

    (FIXTURE_CBC_IV.to_vec(), ciphertext, tag)
}
