//! Response formatting: `<code> <meta>\r\n` followed, on success, by the body.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::application_service::retrieval_service::{
    FailureKind, RetrievalError, RetrievalOutcome, RetrievalService,
};
use crate::port::{ContentFetcher, Decryptor};

/// Meta sent when a request carries no key ID.
pub const MISSING_KEY: &str = "Missing key.";

/// Status codes of the line-oriented response protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    CgiError,
    NotFound,
    BadRequest,
}

impl StatusCode {
    pub fn code(self) -> u8 {
        match self {
            StatusCode::Success => 20,
            StatusCode::CgiError => 42,
            StatusCode::NotFound => 51,
            StatusCode::BadRequest => 59,
        }
    }
}

impl From<FailureKind> for StatusCode {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::NotFound => StatusCode::NotFound,
            FailureKind::MetadataMissing | FailureKind::FetchFailed | FailureKind::DecodeFailed => {
                StatusCode::CgiError
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: StatusCode,
    meta: String,
    body: Option<Vec<u8>>,
}

impl Response {
    pub fn success(mime: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            status: StatusCode::Success,
            meta: one_line(mime.into()),
            body: Some(body),
        }
    }

    /// A bodiless response. Line breaks in `detail` are flattened so the
    /// status line stays a single line.
    pub fn failure(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            meta: one_line(detail.into()),
            body: None,
        }
    }

    pub fn missing_key() -> Self {
        Self::failure(StatusCode::BadRequest, MISSING_KEY)
    }

    pub fn from_error(error: &RetrievalError) -> Self {
        Self::failure(error.kind().into(), error.to_string())
    }

    pub fn from_outcome(outcome: RetrievalOutcome) -> Self {
        match outcome {
            Ok(document) => Self::success(document.mime, document.body),
            Err(error) => Self::from_error(&error),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn meta(&self) -> &str {
        &self.meta
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = format!("{} {}\r\n", self.status.code(), self.meta).into_bytes();
        if let Some(body) = &self.body {
            bytes.extend_from_slice(body);
        }
        bytes
    }

    /// Write the serialized response and flush. Returns the number of bytes
    /// written.
    pub async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<usize>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.to_bytes();
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(bytes.len())
    }
}

/// Answer one request. No lookup is attempted without a key ID.
pub async fn respond<F, D>(service: &RetrievalService<F, D>, key_id: Option<&str>) -> Response
where
    F: ContentFetcher,
    D: Decryptor,
{
    let Some(key_id) = key_id else {
        tracing::warn!("Request without a key ID");
        return Response::missing_key();
    };

    tracing::info!("Request for key `{}`", key_id);
    let outcome = service.retrieve(key_id).await;
    if let Err(e) = &outcome {
        tracing::warn!("Retrieval of `{}` failed ({:?}): {}", key_id, e.kind(), e);
    }
    Response::from_outcome(outcome)
}

fn one_line(meta: String) -> String {
    if meta.contains(['\r', '\n']) {
        meta.replace(['\r', '\n'], " ")
    } else {
        meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Document;
    use crate::infrastructure::{DecompressError, KeyStore};
    use crate::port::{DecryptError, FetchError};
    use crate::test_utils::{bare_key_record, MockContentFetcher, MockDecryptor};
    use std::sync::Arc;

    #[test]
    fn test_success_carries_mime_and_body() {
        let response =
            Response::from_outcome(Ok(Document::new("text/plain", b"hello".to_vec())));

        assert_eq!(response.status(), StatusCode::Success);
        assert_eq!(response.to_bytes(), b"20 text/plain\r\nhello");
    }

    #[test]
    fn test_empty_body_still_has_status_line() {
        let response = Response::success("application/octet-stream", Vec::new());
        assert_eq!(response.to_bytes(), b"20 application/octet-stream\r\n");
    }

    #[test]
    fn test_not_found_is_51() {
        let response = Response::from_outcome(Err(RetrievalError::NotFound("zzz".into())));
        assert_eq!(response.to_bytes(), b"51 Key `zzz` not found.\r\n");
        assert_eq!(response.body(), None);
    }

    #[test]
    fn test_pipeline_failures_are_42() {
        let errors = [
            RetrievalError::MetadataMissing("mime"),
            RetrievalError::Fetch(FetchError::Transport("connection refused".into())),
            RetrievalError::Decompress(DecompressError::from(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated",
            ))),
            RetrievalError::Decrypt(DecryptError::Authentication),
        ];

        for error in &errors {
            let response = Response::from_error(error);
            assert_eq!(response.status().code(), 42);
            assert_eq!(response.meta(), error.to_string());
            assert!(response.body().is_none());
        }
    }

    #[test]
    fn test_missing_key_is_59() {
        assert_eq!(Response::missing_key().to_bytes(), b"59 Missing key.\r\n");
    }

    #[test]
    fn test_meta_is_kept_on_one_line() {
        let response = Response::failure(StatusCode::CgiError, "bad\r\nthing\nhere");
        assert_eq!(response.to_bytes(), b"42 bad  thing here\r\n");
    }

    #[tokio::test]
    async fn test_respond_without_key_id_skips_the_pipeline() {
        let fetcher = MockContentFetcher::new();
        let decryptor = MockDecryptor::new();
        let service = RetrievalService::new(
            Arc::new(KeyStore::from_records([bare_key_record("abc")])),
            fetcher.clone(),
            decryptor.clone(),
        );

        let response = respond(&service, None).await;
        assert_eq!(response.status(), StatusCode::BadRequest);
        assert_eq!(response.meta(), MISSING_KEY);

        let response = respond(&service, Some("zzz")).await;
        assert_eq!(response.to_bytes(), b"51 Key `zzz` not found.\r\n");

        assert!(fetcher.requests().await.is_empty());
        assert_eq!(decryptor.invocations(), 0);
    }

    #[tokio::test]
    async fn test_write_to_reports_bytes_written() {
        let mut sink = Vec::new();
        let written = Response::missing_key().write_to(&mut sink).await.unwrap();

        assert_eq!(written, sink.len());
        assert_eq!(sink, b"59 Missing key.\r\n");
    }
}
