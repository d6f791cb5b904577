//! Single-shot CGI mode.
//!
//! The key ID comes from the `PATH_INFO` environment variable and the
//! response goes to the given writer (stdout in the binary), formatted
//! exactly as over SCGI.

use std::ffi::OsString;

use tokio::io::AsyncWrite;

use crate::application_service::retrieval_service::RetrievalService;
use crate::port::{ContentFetcher, Decryptor};
use crate::presentation::response::{respond, Response, StatusCode};
use crate::presentation::scgi::PATH_INFO;

/// The requested key ID from the process environment.
pub fn key_id_from_env() -> Option<String> {
    key_id_from(std::env::var_os(PATH_INFO))
}

/// An unset or empty value means no key was requested.
pub fn key_id_from(value: Option<OsString>) -> Option<String> {
    value
        .map(|v| v.to_string_lossy().into_owned())
        .filter(|v| !v.is_empty())
}

/// Answer one request on `writer`. Returns the number of bytes written.
pub async fn handle<F, D, W>(
    service: &RetrievalService<F, D>,
    key_id: Option<&str>,
    writer: &mut W,
) -> std::io::Result<usize>
where
    F: ContentFetcher,
    D: Decryptor,
    W: AsyncWrite + Unpin,
{
    respond(service, key_id).await.write_to(writer).await
}

/// Report a gateway that could not start. In CGI mode the writer is the
/// only channel back to the caller.
pub async fn write_startup_failure<W>(writer: &mut W, error: &anyhow::Error) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    Response::failure(StatusCode::CgiError, format!("{error:#}"))
        .write_to(writer)
        .await
}
