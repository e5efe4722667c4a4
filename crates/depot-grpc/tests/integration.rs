//! Integration tests for the FileStore service.
//!
//! Each test starts a real server on an ephemeral port and talks to it with
//! `DepotClient`, or with the generated client where a test needs to break
//! the frame discipline on purpose.

#![allow(clippy::unwrap_used)] // unwrap is acceptable in tests

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::task::{Context, Poll};
use std::time::Duration;

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("depot_grpc=debug,depot=debug")
            .with_test_writer()
            .init();
    });
}

use depot::transfer::MAX_FRAME_SIZE;
use depot::{BackendConfig, Counters};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::{Stream, StreamExt};
use tonic::transport::Channel;
use tonic::{Code, Request, Response, Status, Streaming};

use depot_grpc::proto::{
    ListRequest, ListResponse, ReadRequest, ReadResponse, RemoveRequest, RemoveResponse,
    RenameRequest, RenameResponse, StatRequest, StatResponse, WriteRequest, WriteResponse,
    file_store_server::FileStore, write_request::Member,
};
use depot_grpc::{
    ClientError, ClientOptions, DepotClient, DepotServer, FileStoreClient, FileStoreGrpcServer,
    ServerConfig, ServerError,
};

/// Macro to log messages in tests (visible with --nocapture)
macro_rules! test_log {
    ($($arg:tt)*) => {
        eprintln!("[TEST] {}", format!($($arg)*));
    };
}

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A running server that shuts down when told to.
struct TestServer {
    addr: SocketAddr,
    counters: Arc<Counters>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn start(backend: BackendConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        test_log!("Server bound to {}", addr);

        let mut config = ServerConfig::new(backend);
        config.id = "test".into();
        let server = DepotServer::new(config).unwrap();
        let counters = server.counters();

        let (shutdown, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_with_shutdown(listener, async {
            let _ = rx.await;
        }));

        // Give the server a moment to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            addr,
            counters,
            shutdown,
            handle,
        }
    }

    async fn memory() -> Self {
        Self::start(BackendConfig::Memory).await
    }

    fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    async fn client(&self) -> DepotClient {
        self.client_with(ClientOptions::default()).await
    }

    async fn client_with(&self, options: ClientOptions) -> DepotClient {
        DepotClient::connect(self.endpoint(), options).await.unwrap()
    }

    async fn raw_client(&self) -> FileStoreClient<Channel> {
        FileStoreClient::connect(self.endpoint()).await.unwrap()
    }

    async fn stop(self) {
        self.shutdown.send(()).unwrap();
        timeout(TEST_TIMEOUT, self.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

/// Yields `prefix`, then fails.
struct FailingReader {
    prefix: Vec<u8>,
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.prefix.is_empty() {
            return Poll::Ready(Err(io::Error::other("disk unplugged")));
        }
        let n = self.prefix.len().min(buf.remaining());
        buf.put_slice(&self.prefix[..n]);
        self.prefix.drain(..n);
        Poll::Ready(Ok(()))
    }
}

/// Yields `prefix`, then never becomes ready again.
struct StallingReader {
    prefix: Vec<u8>,
}

impl AsyncRead for StallingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.prefix.is_empty() {
            return Poll::Pending;
        }
        let n = self.prefix.len().min(buf.remaining());
        buf.put_slice(&self.prefix[..n]);
        self.prefix.drain(..n);
        Poll::Ready(Ok(()))
    }
}

fn frame(member: Member) -> WriteRequest {
    WriteRequest {
        member: Some(member),
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Wait until the server has no requests in flight.
async fn settle(counters: &Counters) {
    for _ in 0..100 {
        if counters.snapshot().pending == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("requests still pending: {:?}", counters.snapshot());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_read_stat() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = server.client().await;
    let dir = tempfile::tempdir().unwrap();

    let src = dir.path().join("a.txt");
    std::fs::write(&src, b"hello world").unwrap();
    let size = client.upload(&src).await.unwrap();
    assert_eq!(size, 11);

    let dst = dir.path().join("copy.txt");
    assert_eq!(client.download("a.txt", &dst).await.unwrap(), 11);
    assert_eq!(std::fs::read(&dst).unwrap(), b"hello world");

    let info = client.stat("a.txt").await.unwrap();
    assert_eq!(info.name, "a.txt");
    assert_eq!(info.size, 11);
    assert!(!info.dir);

    settle(&server.counters).await;
    let totals = server.counters.snapshot();
    assert_eq!(totals.total, 3);
    assert_eq!(totals.failed, 0);
    assert_eq!(totals.bytes_received, 11);
    assert_eq!(totals.bytes_sent, 11);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_write_is_rejected() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = server.client().await;

    client
        .upload_reader(&b"hello world"[..], "a.txt", "first")
        .await
        .unwrap();
    let err = client
        .upload_reader(&b"something else"[..], "a.txt", "second")
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::AlreadyExists(_)), "{err}");

    assert_eq!(client.read("a.txt").await.unwrap(), b"hello world");
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rename_then_remove() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = server.client().await;

    client.upload_reader(&b"aaa"[..], "a.txt", "a").await.unwrap();
    client.rename("a.txt", "b.txt").await.unwrap();
    assert_eq!(client.list().await.unwrap(), vec!["b.txt"]);
    assert!(matches!(
        client.stat("a.txt").await,
        Err(ClientError::NotFound(_))
    ));

    client.upload_reader(&b"ccc"[..], "c.txt", "c").await.unwrap();
    assert!(matches!(
        client.rename("b.txt", "c.txt").await,
        Err(ClientError::AlreadyExists(_))
    ));
    assert!(matches!(
        client.rename("missing", "d.txt").await,
        Err(ClientError::NotFound(_))
    ));

    client.remove("b.txt").await.unwrap();
    client.remove("c.txt").await.unwrap();
    assert!(client.list().await.unwrap().is_empty());
    assert!(matches!(
        client.read("b.txt").await,
        Err(ClientError::NotFound(_))
    ));
    assert!(matches!(
        client.remove("b.txt").await,
        Err(ClientError::NotFound(_))
    ));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frame_boundaries() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = server.client().await;

    for (name, len) in [
        ("empty", 0),
        ("one", 1),
        ("under", MAX_FRAME_SIZE - 1),
        ("exact", MAX_FRAME_SIZE),
        ("over", MAX_FRAME_SIZE + 1),
        ("several", 2 * MAX_FRAME_SIZE + 17),
    ] {
        let data = pattern(len);
        let size = client
            .upload_reader(io::Cursor::new(data.clone()), name, name)
            .await
            .unwrap();
        assert_eq!(size, len as u64, "{name}");
        assert_eq!(client.stat(name).await.unwrap().size, len as u64);
        assert_eq!(client.read(name).await.unwrap(), data, "{name}");
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_backend_persists_files() {
    init_tracing();
    let root = tempfile::tempdir().unwrap();
    let server = TestServer::start(BackendConfig::Local {
        path: root.path().to_path_buf(),
    })
    .await;
    let client = server.client().await;

    let data = pattern(MAX_FRAME_SIZE + 100);
    client
        .upload_reader(io::Cursor::new(data.clone()), "blob.bin", "blob")
        .await
        .unwrap();
    assert_eq!(std::fs::read(root.path().join("blob.bin")).unwrap(), data);

    client.rename("blob.bin", "moved.bin").await.unwrap();
    assert!(!root.path().join("blob.bin").exists());
    assert_eq!(client.list().await.unwrap(), vec!["moved.bin"]);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_names_have_no_effect() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = server.client().await;
    client.upload_reader(&b"k"[..], "keep", "keep").await.unwrap();

    fn is_invalid<T>(r: Result<T, ClientError>) -> bool {
        matches!(r, Err(ClientError::InvalidArgument(_)))
    }

    for name in ["", ".", "..", "a/b", "../escape", "/abs"] {
        assert!(
            is_invalid(client.upload_reader(&b"x"[..], name, "x").await),
            "write {name:?}"
        );
        assert!(is_invalid(client.read(name).await), "read {name:?}");
        assert!(is_invalid(client.stat(name).await), "stat {name:?}");
        assert!(is_invalid(client.remove(name).await), "remove {name:?}");
        assert!(is_invalid(client.rename("keep", name).await), "rename {name:?}");
    }

    assert_eq!(client.list().await.unwrap(), vec!["keep"]);
    assert_eq!(client.read("keep").await.unwrap(), b"k");
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_requires_name_first() {
    init_tracing();
    let server = TestServer::memory().await;
    let mut raw = server.raw_client().await;

    let data_first = vec![
        WriteRequest {
            member: Some(Member::Data(b"orphan".to_vec())),
        },
        WriteRequest {
            member: Some(Member::Name("a.txt".into())),
        },
    ];
    let status = raw
        .write(tokio_stream::iter(data_first))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = raw
        .write(tokio_stream::iter(Vec::<WriteRequest>::new()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let name_twice = vec![
        WriteRequest {
            member: Some(Member::Name("a.txt".into())),
        },
        WriteRequest {
            member: Some(Member::Name("b.txt".into())),
        },
    ];
    let status = raw
        .write(tokio_stream::iter(name_twice))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let client = server.client().await;
    assert!(client.list().await.unwrap().is_empty());
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_frame_is_rejected() {
    init_tracing();
    let server = TestServer::memory().await;
    let mut raw = server.raw_client().await;

    let frames = vec![
        WriteRequest {
            member: Some(Member::Name("big.bin".into())),
        },
        WriteRequest {
            member: Some(Member::Data(vec![0; MAX_FRAME_SIZE + 1])),
        },
    ];
    let status = raw.write(tokio_stream::iter(frames)).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let client = server.client().await;
    assert!(matches!(
        client.stat("big.bin").await,
        Err(ClientError::NotFound(_))
    ));
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_upload_stores_nothing() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = server.client().await;

    let reader = FailingReader {
        prefix: b"partial".to_vec(),
    };
    let err = client
        .upload_reader(reader, "partial.txt", "/dev/flaky")
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Io { .. }), "{err}");

    settle(&server.counters).await;
    assert!(client.list().await.unwrap().is_empty());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_client_stops() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = server.client().await;
    client.upload_reader(&b"x"[..], "x", "x").await.unwrap();

    client.cancellation_token().cancel();
    assert!(matches!(client.list().await, Err(ClientError::Cancelled)));
    assert!(matches!(
        client.upload_reader(&b"y"[..], "y", "y").await,
        Err(ClientError::Cancelled)
    ));

    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("x");
    assert!(matches!(
        client.download("x", &dst).await,
        Err(ClientError::Cancelled)
    ));
    assert!(!dst.exists());

    let fresh = server.client().await;
    settle(&server.counters).await;
    assert_eq!(fresh.list().await.unwrap(), vec!["x"]);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_download_of_missing_file_creates_nothing() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = server.client().await;
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("missing");

    assert!(matches!(
        client.download("missing", &dst).await,
        Err(ClientError::NotFound(_))
    ));
    assert!(!dst.exists());
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_uploads_of_one_name() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = server.client().await;

    let uploads = (0..6u8).map(|i| {
        let client = client.clone();
        tokio::spawn(async move {
            let data = vec![i; 4096];
            client
                .upload_reader(io::Cursor::new(data), "contested", "mem")
                .await
        })
    });
    let mut ok = 0;
    for upload in uploads {
        match upload.await.unwrap() {
            Ok(_) => ok += 1,
            Err(ClientError::AlreadyExists(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);

    let content = client.read("contested").await.unwrap();
    assert_eq!(content.len(), 4096);
    assert!(content.iter().all(|b| *b == content[0]));
    server.stop().await;
}

#[tokio::test]
async fn test_connect_to_bad_endpoint_fails() {
    init_tracing();
    let err = DepotClient::connect("not a uri", ClientOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Connect(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_requires_commit() {
    init_tracing();
    let server = TestServer::memory().await;
    let mut raw = server.raw_client().await;

    let uncommitted = vec![
        frame(Member::Name("a.txt".into())),
        frame(Member::Data(b"hello".to_vec())),
    ];
    let status = raw.write(tokio_stream::iter(uncommitted)).await.unwrap_err();
    assert_eq!(status.code(), Code::Aborted);

    let short = vec![
        frame(Member::Name("b.txt".into())),
        frame(Member::Data(b"hello".to_vec())),
        frame(Member::Commit(6)),
    ];
    let status = raw.write(tokio_stream::iter(short)).await.unwrap_err();
    assert_eq!(status.code(), Code::DataLoss);

    let trailing = vec![
        frame(Member::Name("c.txt".into())),
        frame(Member::Data(b"hello".to_vec())),
        frame(Member::Commit(5)),
        frame(Member::Data(b"!".to_vec())),
    ];
    let status = raw.write(tokio_stream::iter(trailing)).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let client = server.client().await;
    assert!(client.list().await.unwrap().is_empty());

    let complete = vec![
        frame(Member::Name("d.txt".into())),
        frame(Member::Data(b"hello".to_vec())),
        frame(Member::Commit(5)),
    ];
    let response = raw.write(tokio_stream::iter(complete)).await.unwrap();
    assert_eq!(response.into_inner().size, 5);
    assert_eq!(client.list().await.unwrap(), vec!["d.txt"]);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_write_stores_nothing() {
    init_tracing();
    let server = TestServer::memory().await;
    let mut raw = server.raw_client().await;

    // The stream never ends; dropping the call resets it part way.
    let frames = tokio_stream::iter(vec![
        frame(Member::Name("dropped.txt".into())),
        frame(Member::Data(b"partial".to_vec())),
    ])
    .chain(tokio_stream::pending());
    let result = timeout(Duration::from_millis(300), raw.write(frames)).await;
    assert!(result.is_err(), "write finished without a commit");

    settle(&server.counters).await;
    let client = server.client().await;
    assert!(client.list().await.unwrap().is_empty());
    assert!(matches!(
        client.stat("dropped.txt").await,
        Err(ClientError::NotFound(_))
    ));
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_during_upload_stores_nothing() {
    init_tracing();
    let server = TestServer::memory().await;
    let client = server
        .client_with(ClientOptions {
            frame_size: 4,
            ..ClientOptions::default()
        })
        .await;

    let upload = tokio::spawn({
        let client = client.clone();
        async move {
            let reader = StallingReader {
                prefix: b"partial".to_vec(),
            };
            client.upload_reader(reader, "stalled.txt", "stall").await
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.cancellation_token().cancel();

    let err = timeout(TEST_TIMEOUT, upload)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ClientError::Cancelled), "{err}");

    settle(&server.counters).await;
    assert_eq!(server.counters.snapshot().failed, 1);
    let fresh = server.client().await;
    assert!(fresh.list().await.unwrap().is_empty());
    server.stop().await;
}

/// How a [`ScriptedReads`] stream ends after its first frame.
#[derive(Debug, Clone, Copy)]
enum ReadTail {
    /// Hold the stream open until the client goes away.
    Stall,
    /// Fail the stream.
    Fail,
}

/// Serves every read as one data frame followed by `tail`.
#[derive(Debug, Clone, Copy)]
struct ScriptedReads {
    tail: ReadTail,
}

#[tonic::async_trait]
impl FileStore for ScriptedReads {
    async fn write(
        &self,
        _request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        Err(Status::unimplemented("write"))
    }

    type ReadStream = Pin<Box<dyn Stream<Item = Result<ReadResponse, Status>> + Send>>;

    async fn read(
        &self,
        _request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        let (tx, rx) = mpsc::channel(1);
        let tail = self.tail;
        tokio::spawn(async move {
            let first = ReadResponse {
                data: b"first".to_vec(),
            };
            if tx.send(Ok(first)).await.is_err() {
                return;
            }
            match tail {
                ReadTail::Stall => tx.closed().await,
                ReadTail::Fail => {
                    let _ = tx.send(Err(Status::internal("backend went away"))).await;
                }
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn list(&self, _request: Request<ListRequest>) -> Result<Response<ListResponse>, Status> {
        Err(Status::unimplemented("list"))
    }

    async fn stat(&self, _request: Request<StatRequest>) -> Result<Response<StatResponse>, Status> {
        Err(Status::unimplemented("stat"))
    }

    async fn rename(
        &self,
        _request: Request<RenameRequest>,
    ) -> Result<Response<RenameResponse>, Status> {
        Err(Status::unimplemented("rename"))
    }

    async fn remove(
        &self,
        _request: Request<RemoveRequest>,
    ) -> Result<Response<RemoveResponse>, Status> {
        Err(Status::unimplemented("remove"))
    }
}

async fn scripted_client(tail: ReadTail) -> (DepotClient, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(FileStoreGrpcServer::new(ScriptedReads { tail }))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = DepotClient::connect(format!("http://{addr}"), ClientOptions::default())
        .await
        .unwrap();
    (client, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_between_download_frames() {
    init_tracing();
    let (client, server) = scripted_client(ReadTail::Stall).await;
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("out.bin");

    let download = tokio::spawn({
        let client = client.clone();
        let dst = dst.clone();
        async move { client.download("any", &dst).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.cancellation_token().cancel();

    let err = timeout(TEST_TIMEOUT, download)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ClientError::Cancelled), "{err}");
    assert!(!dst.exists());
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_download_failing_midway_writes_nothing() {
    init_tracing();
    let (client, server) = scripted_client(ReadTail::Fail).await;
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("out.bin");

    let err = timeout(TEST_TIMEOUT, client.download("any", &dst))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ClientError::Internal(_)), "{err}");
    assert!(!dst.exists());

    assert!(matches!(
        client.read("any").await,
        Err(ClientError::Internal(_))
    ));
    server.abort();
}
