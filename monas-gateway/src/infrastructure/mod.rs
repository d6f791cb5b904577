pub mod decompress;
pub mod ipfs;
pub mod jwe;
pub mod key_store;

pub use decompress::{decompress_if_gzip, DecompressError};
pub use ipfs::{IpfsConnectError, IpfsContentFetcher, DEFAULT_IPFS_API};
pub use jwe::JweDecryptor;
pub use key_store::{KeyStore, KeyStoreError};
