//! SCGI server tests over real sockets.
//!
//! The content store and decryptor are mocked; these tests cover framing,
//! dispatch, status lines and connection handling end to end.

use monas_gateway::infrastructure::KeyStore;
use monas_gateway::presentation::scgi::{ListenTarget, ScgiListener, ScgiServer};
use monas_gateway::test_utils::{
    gzip, oct_key_record_with_metadata, MockContentFetcher, MockDecryptor,
};
use monas_gateway::RetrievalService;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const MAX_HEADER_LEN: usize = 1024 * 1024;

type MockService = RetrievalService<MockContentFetcher, MockDecryptor>;

/// Key store with one record `abc` whose document is gzip-compressed `C`,
/// which decrypts to `hello`.
fn scenario() -> (Arc<MockService>, MockContentFetcher, MockDecryptor) {
    let fetcher = MockContentFetcher::new().with_content("X", gzip(b"C"));
    let decryptor = MockDecryptor::new().with_plaintext(b"C", b"hello");
    let key_store = KeyStore::from_records([oct_key_record_with_metadata(
        "abc",
        Some("text/plain"),
        Some("X"),
    )]);

    let service = Arc::new(RetrievalService::new(
        Arc::new(key_store),
        fetcher.clone(),
        decryptor.clone(),
    ));
    (service, fetcher, decryptor)
}

struct RunningServer {
    target: ListenTarget,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RunningServer {
    async fn start(service: Arc<MockService>, target: ListenTarget) -> Self {
        let listener = ScgiListener::bind(&target).await.unwrap();
        let target = listener.local_target().unwrap();
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            ScgiServer::new(service, MAX_HEADER_LEN)
                .serve(listener, async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Self {
            target,
            shutdown,
            handle,
        }
    }

    /// Send one frame, half-close, and read the reply until the server
    /// closes the connection.
    async fn request(&self, frame: &[u8]) -> Vec<u8> {
        let mut reply = Vec::new();
        match &self.target {
            ListenTarget::Tcp(addr) => {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                stream.write_all(frame).await.unwrap();
                stream.shutdown().await.unwrap();
                stream.read_to_end(&mut reply).await.unwrap();
            }
            ListenTarget::Unix(path) => {
                let mut stream = UnixStream::connect(path).await.unwrap();
                stream.write_all(frame).await.unwrap();
                stream.shutdown().await.unwrap();
                stream.read_to_end(&mut reply).await.unwrap();
            }
        }
        reply
    }

    async fn stop(self) {
        self.shutdown.send(()).unwrap();
        self.handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_tcp_document_and_not_found() {
    let (service, _, _) = scenario();
    let server = RunningServer::start(service, ListenTarget::Tcp("127.0.0.1:0".parse().unwrap())).await;

    let reply = server.request(b"14:PATH_INFO\0abc\0,").await;
    assert_eq!(reply, b"20 text/plain\r\nhello");

    let reply = server.request(b"14:PATH_INFO\0zzz\0,").await;
    assert_eq!(reply, b"51 Key `zzz` not found.\r\n");

    server.stop().await;
}

#[tokio::test]
async fn test_unix_socket_serves_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gateway.socket");
    let (service, _, _) = scenario();
    let server = RunningServer::start(service, ListenTarget::Unix(path.clone())).await;

    let reply = server.request(b"14:PATH_INFO\0abc\0,").await;
    assert_eq!(reply, b"20 text/plain\r\nhello");

    server.stop().await;
    assert!(!path.exists(), "socket file should be removed on shutdown");
}

#[tokio::test]
async fn test_missing_key_never_reaches_the_pipeline() {
    let (service, fetcher, decryptor) = scenario();
    let server = RunningServer::start(service, ListenTarget::Tcp("127.0.0.1:0".parse().unwrap())).await;

    let reply = server.request(b"11:PATH_INFO\0\0,").await;
    assert_eq!(reply, b"59 Missing key.\r\n");

    let reply = server.request(b"26:REQUEST_METHOD\0GET\0SCGI\x001\0,").await;
    assert_eq!(reply, b"59 Missing key.\r\n");

    assert!(fetcher.requests().await.is_empty());
    assert_eq!(decryptor.invocations(), 0);
    server.stop().await;
}

#[tokio::test]
async fn test_bad_frames_get_42_and_server_keeps_serving() {
    let (service, fetcher, _) = scenario();
    let server = RunningServer::start(service, ListenTarget::Tcp("127.0.0.1:0".parse().unwrap())).await;

    let reply = server.request(b"abc:PATH_INFO\0abc\0,").await;
    assert!(reply.starts_with(b"42 "), "{}", String::from_utf8_lossy(&reply));

    let reply = server.request(b"18:PATH_INFO\0abc\0,").await;
    assert!(reply.starts_with(b"42 "), "{}", String::from_utf8_lossy(&reply));

    let reply = server.request(b"99999999:PATH_INFO\0abc\0,").await;
    assert!(reply.starts_with(b"42 "), "{}", String::from_utf8_lossy(&reply));

    assert!(fetcher.requests().await.is_empty());

    let reply = server.request(b"14:PATH_INFO\0abc\0,").await;
    assert_eq!(reply, b"20 text/plain\r\nhello");

    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_connections_are_independent() {
    let (service, fetcher, _) = scenario();
    let server = Arc::new(
        RunningServer::start(service, ListenTarget::Tcp("127.0.0.1:0".parse().unwrap())).await,
    );

    let mut clients = Vec::new();
    for i in 0..16 {
        let server = server.clone();
        clients.push(tokio::spawn(async move {
            if i % 2 == 0 {
                server.request(b"14:PATH_INFO\0abc\0,").await
            } else {
                server.request(b"14:PATH_INFO\0zzz\0,").await
            }
        }));
    }

    for (i, client) in clients.into_iter().enumerate() {
        let reply = client.await.unwrap();
        if i % 2 == 0 {
            assert_eq!(reply, b"20 text/plain\r\nhello");
        } else {
            assert_eq!(reply, b"51 Key `zzz` not found.\r\n");
        }
    }
    assert_eq!(fetcher.requests().await.len(), 8);

    let server = Arc::try_unwrap(server).ok().unwrap();
    server.stop().await;
}
