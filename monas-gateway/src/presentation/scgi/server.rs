//! SCGI connection server.
//!
//! Each accepted connection is handled on its own task: decode one frame,
//! run the retrieval pipeline for its `PATH_INFO`, write one response and
//! close. Connections share nothing but the read-only retrieval service.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::Instrument;
use uuid::Uuid;

use super::frame;
use crate::application_service::retrieval_service::RetrievalService;
use crate::port::{ContentFetcher, Decryptor};
use crate::presentation::response::{respond, Response, StatusCode};

/// Where the server accepts connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenTarget {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl fmt::Display for ListenTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenTarget::Unix(path) => write!(f, "unix:{}", path.display()),
            ListenTarget::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// A bound listening socket.
#[derive(Debug)]
pub enum ScgiListener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

enum Connection {
    Unix(UnixStream),
    Tcp(TcpStream, SocketAddr),
}

impl ScgiListener {
    /// Bind `target`. A socket file left behind at a unix path by an earlier
    /// run is removed first; any other existing file makes the bind fail.
    pub async fn bind(target: &ListenTarget) -> io::Result<Self> {
        match target {
            ListenTarget::Unix(path) => {
                remove_stale_socket(path)?;
                let listener = UnixListener::bind(path)?;
                Ok(Self::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            ListenTarget::Tcp(addr) => Ok(Self::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    /// The bound address. For TCP this carries the actual port when binding
    /// to port 0.
    pub fn local_target(&self) -> io::Result<ListenTarget> {
        match self {
            Self::Unix { path, .. } => Ok(ListenTarget::Unix(path.clone())),
            Self::Tcp(listener) => Ok(ListenTarget::Tcp(listener.local_addr()?)),
        }
    }

    async fn accept(&self) -> io::Result<Connection> {
        match self {
            Self::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::Unix(stream))
            }
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok(Connection::Tcp(stream, peer))
            }
        }
    }

    fn close(self) {
        if let Self::Unix { listener, path } = self {
            drop(listener);
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to remove socket {}: {}", path.display(), e);
            }
        }
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            tracing::info!("Removing stale socket {}", path.display());
            std::fs::remove_file(path)
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Accept loop dispatching SCGI requests to a [`RetrievalService`].
pub struct ScgiServer<F, D> {
    service: Arc<RetrievalService<F, D>>,
    max_header_len: usize,
}

impl<F, D> ScgiServer<F, D>
where
    F: ContentFetcher + 'static,
    D: Decryptor + 'static,
{
    pub fn new(service: Arc<RetrievalService<F, D>>, max_header_len: usize) -> Self {
        Self {
            service,
            max_header_len,
        }
    }

    /// Accept connections until `shutdown` completes, then close the
    /// listener (removing its socket file). In-flight connections run to
    /// completion on their own tasks.
    pub async fn serve<S>(&self, listener: ScgiListener, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutting down SCGI server");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(connection) => self.spawn(connection),
                    Err(e) => tracing::warn!("Failed to accept connection: {}", e),
                },
            }
        }

        listener.close();
    }

    fn spawn(&self, connection: Connection) {
        let service = self.service.clone();
        let max_header_len = self.max_header_len;
        let span = tracing::info_span!("connection", id = %Uuid::new_v4());

        match connection {
            Connection::Unix(stream) => {
                tokio::spawn(handle_connection(service, stream, max_header_len).instrument(span));
            }
            Connection::Tcp(stream, peer) => {
                span.in_scope(|| tracing::debug!("Accepted connection from {}", peer));
                tokio::spawn(handle_connection(service, stream, max_header_len).instrument(span));
            }
        }
    }
}

/// Serve a single request on `stream` and close it.
pub async fn handle_connection<S, F, D>(
    service: Arc<RetrievalService<F, D>>,
    stream: S,
    max_header_len: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    F: ContentFetcher,
    D: Decryptor,
{
    let mut stream = BufReader::new(stream);

    let response = match frame::decode(&mut stream, max_header_len).await {
        Ok(request) => respond(&*service, request.key_id()).await,
        Err(e) => {
            tracing::warn!("Failed to decode request: {}", e);
            Response::failure(StatusCode::CgiError, e.to_string())
        }
    };

    match response.write_to(&mut stream).await {
        Ok(sent) => tracing::debug!("Sent {} bytes (status {})", sent, response.status().code()),
        Err(e) => {
            tracing::warn!("Failed to write response: {}", e);
            let _ = Response::failure(StatusCode::CgiError, e.to_string())
                .write_to(&mut stream)
                .await;
        }
    }

    if let Err(e) = stream.shutdown().await {
        tracing::debug!("Failed to shut down connection: {}", e);
    }
}
