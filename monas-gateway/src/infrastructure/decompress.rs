//! Gzip stage of the retrieval pipeline.

use flate2::bufread::GzDecoder;
use std::io::Read;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, thiserror::Error)]
pub enum DecompressError {
    #[error("gzip decompression failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("gzip decompression failed: {0} trailing bytes are not a gzip member")]
    TrailingData(usize),
}

pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

/// Gunzip `data` when it carries the gzip magic, otherwise hand it back
/// untouched.
///
/// Concatenated members are decoded in order. Anything after the last
/// member that is not itself a gzip member is an error.
pub fn decompress_if_gzip(data: Vec<u8>) -> Result<Vec<u8>, DecompressError> {
    if !is_gzip(&data) {
        return Ok(data);
    }

    let mut decompressed = Vec::new();
    let mut rest = data.as_slice();
    while !rest.is_empty() {
        if !is_gzip(rest) {
            return Err(DecompressError::TrailingData(rest.len()));
        }
        // The bufread decoder stops right after the member's trailer.
        let mut member = GzDecoder::new(rest);
        member.read_to_end(&mut decompressed)?;
        rest = member.into_inner();
    }
    Ok(decompressed)
}
