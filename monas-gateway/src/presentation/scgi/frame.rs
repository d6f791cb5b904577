//! SCGI request frame decoding.
//!
//! A frame is `<len>:<header block>,` where the header block is `len` bytes
//! of NUL-terminated strings read as (name, value) pairs.

use indexmap::IndexMap;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Header carrying the requested key ID.
pub const PATH_INFO: &str = "PATH_INFO";

/// Longest length prefix echoed back in an error.
const MAX_SHOWN_PREFIX: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length prefix `{0}`")]
    InvalidLength(String),
    #[error("frame header block of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("frame truncated: expected {expected} header bytes")]
    Truncated { expected: usize },
    #[error("frame terminator missing")]
    MissingTerminator,
    #[error("failed to read frame: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded request headers, kept in arrival order. A repeated name keeps
/// its first position but takes the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramedRequest {
    headers: IndexMap<String, String>,
}

impl FramedRequest {
    /// Parse a header block (the bytes between `:` and the terminator).
    /// A trailing name without a value is ignored.
    pub fn from_header_block(block: &[u8]) -> Self {
        let block = block.strip_suffix(&[0]).unwrap_or(block);
        let fields: Vec<&[u8]> = block.split(|b| *b == 0).collect();
        let headers = fields
            .chunks_exact(2)
            .map(|pair| {
                (
                    String::from_utf8_lossy(pair[0]).into_owned(),
                    String::from_utf8_lossy(pair[1]).into_owned(),
                )
            })
            .collect();
        Self { headers }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The requested key ID: `PATH_INFO` when present and non-empty.
    pub fn key_id(&self) -> Option<&str> {
        self.get(PATH_INFO).filter(|id| !id.is_empty())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

/// Read exactly one frame from `reader`.
///
/// Declared lengths above `max_len` are rejected before any header byte is
/// read. The terminator byte is consumed but its value is not checked.
pub async fn decode<R>(reader: &mut R, max_len: usize) -> Result<FramedRequest, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = read_length(reader).await?;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mut block = vec![0u8; len];
    reader
        .read_exact(&mut block)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::Truncated { expected: len },
            _ => FrameError::Io(e),
        })?;

    match reader.read_u8().await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::MissingTerminator)
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    Ok(FramedRequest::from_header_block(&block))
}

/// Read the decimal length prefix up to and including the `:`.
///
/// Leading zeros are allowed; the value must fit in `usize`.
async fn read_length<R>(reader: &mut R) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len: usize = 0;
    let mut prefix = String::new();
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::InvalidLength(prefix))
            }
            Err(e) => return Err(FrameError::Io(e)),
        };

        if byte == b':' {
            if prefix.is_empty() {
                return Err(FrameError::InvalidLength(prefix));
            }
            return Ok(len);
        }
        if prefix.len() < MAX_SHOWN_PREFIX {
            prefix.push(char::from(byte));
        }
        if !byte.is_ascii_digit() {
            return Err(FrameError::InvalidLength(prefix));
        }

        let digit = usize::from(byte - b'0');
        len = match len.checked_mul(10).and_then(|len| len.checked_add(digit)) {
            Some(len) => len,
            None => return Err(FrameError::InvalidLength(prefix)),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    const MAX: usize = 1024 * 1024;

    /// Hands out at most `chunk` bytes per read.
    struct Fragmented {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl AsyncRead for Fragmented {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let end = (self.pos + self.chunk)
                .min(self.data.len())
                .min(self.pos + buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.data[start..end]);
            self.pos = end;
            Poll::Ready(Ok(()))
        }
    }

    async fn decode_bytes(bytes: &[u8]) -> Result<FramedRequest, FrameError> {
        let mut reader = bytes;
        decode(&mut reader, MAX).await
    }

    #[tokio::test]
    async fn test_decode_path_info() {
        let request = decode_bytes(b"14:PATH_INFO\0abc\0,").await.unwrap();

        assert_eq!(request.get(PATH_INFO), Some("abc"));
        assert_eq!(request.key_id(), Some("abc"));
        assert_eq!(request.len(), 1);
    }

    #[tokio::test]
    async fn test_decode_keeps_all_headers_in_order() {
        let block = b"CONTENT_LENGTH\00\0SCGI\01\0PATH_INFO\0k1\0SERVER_NAME\0example.org\0";
        let frame = [
            format!("{}:", block.len()).into_bytes(),
            block.to_vec(),
            b",".to_vec(),
        ]
        .concat();

        let request = decode_bytes(&frame).await.unwrap();
        let names: Vec<&str> = request.headers().map(|(name, _)| name).collect();
        assert_eq!(names, ["CONTENT_LENGTH", "SCGI", "PATH_INFO", "SERVER_NAME"]);
        assert_eq!(request.get("SERVER_NAME"), Some("example.org"));
    }

    #[tokio::test]
    async fn test_fragmented_reads_decode_identically() {
        let frame = b"45:PATH_INFO\0some-key\0REQUEST_METHOD\0GET\0SCGI\01\0,".to_vec();
        let whole = decode_bytes(&frame).await.unwrap();

        for chunk in [1, 2, 3, 7, 64] {
            let mut reader = Fragmented {
                data: frame.clone(),
                pos: 0,
                chunk,
            };
            let fragmented = decode(&mut reader, MAX).await.unwrap();
            assert_eq!(fragmented, whole, "chunk size {chunk}");
        }
        assert_eq!(whole.key_id(), Some("some-key"));
    }

    #[tokio::test]
    async fn test_non_numeric_length_fails() {
        let err = decode_bytes(b"abc:PATH_INFO\0abc\0,").await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength(_)));

        let err = decode_bytes(b":PATH_INFO\0abc\0,").await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength(_)));

        let err = decode_bytes(b"").await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength(_)));
    }

    #[tokio::test]
    async fn test_length_prefix_is_bounded_by_value() {
        let request = decode_bytes(b"000000000000000000014:PATH_INFO\0abc\0,")
            .await
            .unwrap();
        assert_eq!(request.key_id(), Some("abc"));

        let err = decode_bytes(b"99999999999999999999:x,").await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength(_)));

        let err = decode_bytes(b"184467440737095516160:x,").await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength(_)));
    }

    #[tokio::test]
    async fn test_length_beyond_limit_fails_before_reading_block() {
        let mut reader: &[u8] = b"2048:PATH_INFO\0abc\0,";
        let err = decode(&mut reader, 1024).await.unwrap_err();

        assert!(matches!(err, FrameError::TooLarge { len: 2048, max: 1024 }));
        assert_eq!(reader, b"PATH_INFO\0abc\0,");
    }

    #[tokio::test]
    async fn test_declared_length_beyond_stream_fails() {
        let err = decode_bytes(b"18:PATH_INFO\0abc\0,").await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated { expected: 18 }));
    }

    #[tokio::test]
    async fn test_missing_terminator_fails() {
        let err = decode_bytes(b"14:PATH_INFO\0abc\0").await.unwrap_err();
        assert!(matches!(err, FrameError::MissingTerminator));
    }

    #[tokio::test]
    async fn test_dangling_field_is_ignored() {
        let request = decode_bytes(b"21:PATH_INFO\0abc\0ORPHAN\0,").await.unwrap();

        assert_eq!(request.key_id(), Some("abc"));
        assert_eq!(request.get("ORPHAN"), None);
        assert_eq!(request.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_header_last_value_wins() {
        let request = decode_bytes(b"26:PATH_INFO\0a\0PATH_INFO\0bbb\0,").await.unwrap();
        assert_eq!(request.key_id(), Some("bbb"));
        assert_eq!(request.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_or_absent_path_info_has_no_key_id() {
        let request = decode_bytes(b"11:PATH_INFO\0\0,").await.unwrap();
        assert_eq!(request.get(PATH_INFO), Some(""));
        assert_eq!(request.key_id(), None);

        let request = decode_bytes(b"0:,").await.unwrap();
        assert!(request.is_empty());
        assert_eq!(request.key_id(), None);
    }

    #[tokio::test]
    async fn test_non_utf8_header_bytes_are_replaced() {
        let request = decode_bytes(b"12:PATH_INFO\0\xff\0,").await.unwrap();
        assert_eq!(request.key_id(), Some("\u{fffd}"));
    }
}
