//! IPFS content fetcher backed by the Kubo RPC API.

use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use multiaddr::{Multiaddr, Protocol};
use reqwest::{Client, Response};
use serde::Deserialize;

use crate::port::content_fetcher::{ContentFetcher, FetchError};

/// Default multiaddr of a local Kubo daemon's RPC API.
pub const DEFAULT_IPFS_API: &str = "/ip4/127.0.0.1/tcp/5001";

/// Size of the requested content, sent by `cat` before streaming it.
const CONTENT_LENGTH_HEADER: &str = "x-content-length";

#[derive(Debug, thiserror::Error)]
pub enum IpfsConnectError {
    #[error("invalid IPFS API address `{addr}`: {reason}")]
    InvalidAddress { addr: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Error body returned by the Kubo RPC API.
#[derive(Deserialize)]
struct ApiError {
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "Version")]
    version: String,
}

/// Fetches blobs through `POST /api/v0/cat`.
#[derive(Debug, Clone)]
pub struct IpfsContentFetcher {
    base_url: String,
    http_client: Client,
}

impl IpfsContentFetcher {
    /// Build a client for the RPC API at `api`, given either as a multiaddr
    /// (`/ip4/127.0.0.1/tcp/5001`) or as an `http(s)://` URL.
    ///
    /// No request is made; use [`IpfsContentFetcher::check_version`] to check that
    /// the daemon answers.
    pub fn connect(api: &str, timeout: Option<Duration>) -> Result<Self, IpfsConnectError> {
        let base_url = api_base_url(api)?;

        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder
            .build()
            .map_err(|e| IpfsConnectError::Client(e.to_string()))?;

        Ok(Self {
            base_url,
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask the daemon for its version.
    pub async fn check_version(&self) -> Result<String, FetchError> {
        let response = self.post("version").await?;
        let info: VersionInfo = response
            .json()
            .await
            .map_err(|e| FetchError::Store(format!("unexpected version response: {e}")))?;
        Ok(info.version)
    }

    async fn post(&self, command_and_query: &str) -> Result<Response, FetchError> {
        let url = format!("{}/api/v0/{}", self.base_url, command_and_query);
        let response = self
            .http_client
            .post(&url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(FetchError::Store(error_message(response).await))
        }
    }
}

#[async_trait]
impl ContentFetcher for IpfsContentFetcher {
    async fn fetch(&self, content_id: &str) -> Result<Vec<u8>, FetchError> {
        let cid: Cid = content_id
            .parse()
            .map_err(|e: cid::Error| FetchError::InvalidContentId {
                content_id: content_id.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!("Fetching {} from {}", cid, self.base_url);
        let response = self.post(&format!("cat?arg={cid}")).await?;
        let declared = declared_length(&response);
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        // A failure after streaming has begun is reported in the
        // `X-Stream-Error` trailer, which reqwest does not expose. A short
        // body is the visible symptom.
        if let Some(declared) = declared {
            if body.len() as u64 != declared {
                return Err(FetchError::Store(format!(
                    "{cid}: received {} of {declared} bytes",
                    body.len()
                )));
            }
        }

        Ok(body.to_vec())
    }
}

fn declared_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH_HEADER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

async fn error_message(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => api_error.message,
        Err(_) if body.trim().is_empty() => status.to_string(),
        Err(_) => format!("{status}: {}", body.trim()),
    }
}

/// Resolve the RPC API base URL (scheme, host and port, no trailing slash).
pub fn api_base_url(api: &str) -> Result<String, IpfsConnectError> {
    if api.starts_with("http://") || api.starts_with("https://") {
        return Ok(api.trim_end_matches('/').to_string());
    }

    let invalid = |reason: String| IpfsConnectError::InvalidAddress {
        addr: api.to_string(),
        reason,
    };
    let addr: Multiaddr = api.parse().map_err(|e: multiaddr::Error| invalid(e.to_string()))?;

    let mut host = None;
    let mut port = None;
    let mut scheme = "http";
    for protocol in addr.iter() {
        match protocol {
            Protocol::Ip4(ip) => host = Some(ip.to_string()),
            Protocol::Ip6(ip) => host = Some(format!("[{ip}]")),
            Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
                host = Some(name.to_string())
            }
            Protocol::Tcp(p) => port = Some(p),
            Protocol::Http => scheme = "http",
            Protocol::Https => scheme = "https",
            other => return Err(invalid(format!("unsupported protocol `{other}`"))),
        }
    }

    let host = host.ok_or_else(|| invalid("no host component".into()))?;
    let port = port.ok_or_else(|| invalid("no tcp component".into()))?;
    Ok(format!("{scheme}://{host}:{port}"))
}
