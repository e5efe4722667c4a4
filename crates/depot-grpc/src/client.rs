//! Client driver for the FileStore service.
//!
//! Mirrors the server's transfer logic from the other end of the stream:
//! uploads read a local source in frame-sized blocks, downloads reassemble
//! frames and persist them once the stream has closed cleanly. Every call
//! races the client's cancellation token, so cancelling aborts an in-flight
//! stream at the next frame boundary.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use depot::transfer::{
    self, ChunkReader, Frame, MAX_FRAME_SIZE, MAX_MESSAGE_SIZE, Reassembler, frame_size_for,
};
use depot::{FileInfo, TransferError};
use prost::Message as _;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::codec::{Codec, EncodeBuf, Encoder, ProstCodec};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

use crate::convert::file_info_from_proto;
use crate::proto::{
    ListRequest, ReadRequest, RemoveRequest, RenameRequest, StatRequest, WriteRequest,
    WriteResponse, file_store_client::FileStoreClient,
};

/// Upload frames buffered ahead of the transport.
const UPLOAD_CHANNEL_DEPTH: usize = 4;

/// How long a cancelled upload waits for the server to see the reset.
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// Errors returned by [`DepotClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The endpoint was malformed or unreachable.
    #[error("failed to connect: {0}")]
    Connect(#[source] tonic::transport::Error),
    /// The server rejected a name or request shape.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The named file does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The target name is already taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The server failed internally.
    #[error("server error: {0}")]
    Internal(String),
    /// Any other RPC failure.
    #[error("rpc failed: {0}")]
    Status(Status),
    /// Local file I/O failed.
    #[error("{}: {source}", path.display())]
    Io {
        /// Local file involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
    /// A transfer broke the frame discipline or failed its size check.
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),
    /// The server answered with something unusable.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ClientError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<Status> for ClientError {
    fn from(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::InvalidArgument => ClientError::InvalidArgument(message),
            Code::NotFound => ClientError::NotFound(message),
            Code::AlreadyExists => ClientError::AlreadyExists(message),
            Code::Internal => ClientError::Internal(message),
            Code::Cancelled => ClientError::Cancelled,
            _ => ClientError::Status(status),
        }
    }
}

/// Connection settings for [`DepotClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Largest gRPC message accepted or sent, in bytes.
    pub max_message_size: usize,
    /// Upload block size; clamped to what fits in `max_message_size`.
    pub frame_size: usize,
    /// Give up connecting after this long.
    pub connect_timeout: Option<Duration>,
    /// Cancels connection setup and every later operation.
    pub cancel: CancellationToken,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            frame_size: MAX_FRAME_SIZE,
            connect_timeout: Some(Duration::from_secs(10)),
            cancel: CancellationToken::new(),
        }
    }
}

/// A connected FileStore client.
#[derive(Debug, Clone)]
pub struct DepotClient {
    channel: Channel,
    inner: FileStoreClient<Channel>,
    max_message_size: usize,
    frame_size: usize,
    recv_cap: usize,
    cancel: CancellationToken,
}

impl DepotClient {
    /// Connect to `endpoint` (e.g. `http://127.0.0.1:8080`).
    ///
    /// The transport is established eagerly, so a bad endpoint fails here
    /// rather than on the first operation.
    pub async fn connect(
        endpoint: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let recv_cap = frame_size_for(options.max_message_size).ok_or_else(|| {
            ClientError::InvalidArgument(format!(
                "max_message_size {} leaves no room for data",
                options.max_message_size
            ))
        })?;

        let mut endpoint = Endpoint::from_shared(endpoint.into()).map_err(ClientError::Connect)?;
        if let Some(timeout) = options.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }

        let channel = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => return Err(ClientError::Cancelled),
            channel = endpoint.connect() => channel.map_err(ClientError::Connect)?,
        };

        let inner = FileStoreClient::new(channel.clone())
            .max_decoding_message_size(options.max_message_size)
            .max_encoding_message_size(options.max_message_size);

        Ok(Self {
            channel,
            inner,
            max_message_size: options.max_message_size,
            frame_size: options.frame_size.clamp(1, recv_cap),
            recv_cap,
            cancel: options.cancel,
        })
    }

    /// The token that cancels this client's operations.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `fut` unless the client is cancelled first.
    async fn cancellable<T, F>(&self, fut: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ClientError::Cancelled),
            result = fut => result,
        }
    }

    /// Upload the file at `src` under its base name.
    pub async fn upload(&self, src: impl AsRef<Path>) -> Result<u64, ClientError> {
        let src = src.as_ref();
        let name = src
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ClientError::InvalidArgument(format!("{} has no usable file name", src.display()))
            })?;
        self.upload_as(src, name).await
    }

    /// Upload the file at `src` as `name`. Returns the bytes stored.
    pub async fn upload_as(&self, src: impl AsRef<Path>, name: &str) -> Result<u64, ClientError> {
        let src = src.as_ref();
        let file = tokio::fs::File::open(src)
            .await
            .map_err(|e| ClientError::io(src, e))?;
        self.upload_reader(file, name, src).await
    }

    /// Stream everything `reader` yields to the server as `name`.
    ///
    /// `origin` only labels local read errors.
    pub async fn upload_reader<R>(
        &self,
        reader: R,
        name: &str,
        origin: impl AsRef<Path>,
    ) -> Result<u64, ClientError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let (tx, rx) = mpsc::channel::<UploadItem>(UPLOAD_CHANNEL_DEPTH);
        let abort = self.cancel.child_token();

        let producer = tokio::spawn(produce_frames(
            ChunkReader::new(reader, self.frame_size),
            name.to_string(),
            origin.as_ref().to_path_buf(),
            tx,
            abort.clone(),
        ));

        let mut grpc = tonic::client::Grpc::new(self.channel.clone())
            .max_decoding_message_size(self.max_message_size)
            .max_encoding_message_size(self.max_message_size);
        let call = async move {
            grpc.ready().await.map_err(ClientError::Connect)?;
            let path = PathAndQuery::from_static(WRITE_PATH);
            let response = grpc
                .client_streaming(tonic::Request::new(ReceiverStream::new(rx)), path, UploadCodec)
                .await?;
            Ok::<_, ClientError>(response.into_inner())
        };
        tokio::pin!(call);

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            outcome = &mut call => Some(outcome),
        };
        let Some(outcome) = outcome else {
            // The producer resets the stream on cancellation. Keep driving the
            // call so the reset actually reaches the server.
            if tokio::time::timeout(ABORT_GRACE, &mut call).await.is_err() {
                tracing::warn!(name, "Server did not acknowledge the aborted upload");
            }
            return Err(ClientError::Cancelled);
        };
        if outcome.is_err() {
            // The server ended the call early; stop feeding it.
            abort.cancel();
        }

        let produced = producer
            .await
            .map_err(|e| ClientError::Internal(format!("upload task failed: {e}")))?;
        let response = match (outcome, produced) {
            // A local read failure is the root cause of whatever the call saw.
            (_, Err(e @ ClientError::Io { .. })) => return Err(e),
            (Err(e), _) | (Ok(_), Err(e)) => return Err(e),
            (Ok(response), Ok(sent)) => {
                transfer::check_size(sent, response.size)?;
                response
            }
        };

        tracing::debug!(name, "Uploaded {} bytes", response.size);
        Ok(response.size)
    }

    /// Download `name` into `dst`, creating or truncating it.
    ///
    /// Nothing is written unless the whole stream arrives; a stream that
    /// fails part way is a total failure. Returns the bytes received.
    pub async fn download(&self, name: &str, dst: impl AsRef<Path>) -> Result<u64, ClientError> {
        let dst = dst.as_ref();
        let content = self.fetch(name).await?;
        let received = content.bytes();

        if self.cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        tokio::fs::write(dst, content.into_inner())
            .await
            .map_err(|e| ClientError::io(dst, e))?;

        let persisted = tokio::fs::metadata(dst)
            .await
            .map_err(|e| ClientError::io(dst, e))?
            .len();
        if let Err(e) = transfer::check_size(received, persisted) {
            if let Err(rm) = tokio::fs::remove_file(dst).await {
                tracing::warn!("Failed to remove {}: {}", dst.display(), rm);
            }
            return Err(e.into());
        }

        tracing::debug!(name, "Downloaded {} bytes to {}", received, dst.display());
        Ok(received)
    }

    /// Download `name` into memory.
    pub async fn read(&self, name: &str) -> Result<Vec<u8>, ClientError> {
        Ok(self.fetch(name).await?.into_inner())
    }

    async fn fetch(&self, name: &str) -> Result<Reassembler, ClientError> {
        let mut client = self.inner.clone();
        let request = ReadRequest {
            name: name.to_string(),
        };
        let mut stream = self
            .cancellable(async { Ok(client.read(request).await?.into_inner()) })
            .await?;

        let mut content = Reassembler::new(self.recv_cap);
        loop {
            let message = self
                .cancellable(async { Ok(stream.message().await?) })
                .await?;
            match message {
                Some(frame) => content.push(&frame.data)?,
                None => break,
            }
        }
        Ok(content)
    }

    /// Names of all stored files.
    pub async fn list(&self) -> Result<Vec<String>, ClientError> {
        let mut client = self.inner.clone();
        self.cancellable(async move { Ok(client.list(ListRequest {}).await?.into_inner().files) })
            .await
    }

    /// Attributes of `name`.
    pub async fn stat(&self, name: &str) -> Result<FileInfo, ClientError> {
        let mut client = self.inner.clone();
        let request = StatRequest {
            name: name.to_string(),
        };
        let response = self
            .cancellable(async move { Ok(client.stat(request).await?.into_inner()) })
            .await?;
        let info = response
            .file_info
            .ok_or_else(|| ClientError::InvalidResponse("stat response without file info".into()))?;
        file_info_from_proto(info).map_err(ClientError::InvalidResponse)
    }

    /// Rename `old` to `new`.
    pub async fn rename(&self, old: &str, new: &str) -> Result<(), ClientError> {
        let mut client = self.inner.clone();
        let request = RenameRequest {
            old: old.to_string(),
            new: new.to_string(),
        };
        self.cancellable(async move {
            client.rename(request).await?;
            Ok(())
        })
        .await
    }

    /// Delete `name`.
    pub async fn remove(&self, name: &str) -> Result<(), ClientError> {
        let mut client = self.inner.clone();
        let request = RemoveRequest {
            name: name.to_string(),
        };
        self.cancellable(async move {
            client.remove(request).await?;
            Ok(())
        })
        .await
    }
}

/// Feed the upload stream: the name first, then the source block by block,
/// then the commit frame with the total size.
///
/// Any failure or cancellation ends the stream with [`UploadItem::Abort`]
/// and no commit, so the server never stores a short upload.
async fn produce_frames<R>(
    mut reader: ChunkReader<R>,
    name: String,
    origin: PathBuf,
    tx: mpsc::Sender<UploadItem>,
    abort: CancellationToken,
) -> Result<u64, ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut next = Some(Frame::Metadata { name });
    while let Some(frame) = next.take() {
        let last = matches!(frame, Frame::Commit { .. });
        let sent = tokio::select! {
            biased;
            _ = abort.cancelled() => return abort_upload(&tx, ClientError::Cancelled).await,
            sent = tx.send(UploadItem::Frame(frame.into())) => sent,
        };
        if sent.is_err() {
            // The call already ended; its result carries the reason.
            break;
        }
        if last {
            break;
        }

        let chunk = tokio::select! {
            biased;
            _ = abort.cancelled() => return abort_upload(&tx, ClientError::Cancelled).await,
            chunk = reader.next_chunk() => chunk,
        };
        match chunk {
            Ok(Some(data)) => next = Some(Frame::Data(data)),
            Ok(None) => {
                next = Some(Frame::Commit {
                    size: reader.bytes_read(),
                })
            }
            Err(e) => return abort_upload(&tx, ClientError::io(&origin, e)).await,
        }
    }
    Ok(reader.bytes_read())
}

async fn abort_upload(tx: &mpsc::Sender<UploadItem>, err: ClientError) -> Result<u64, ClientError> {
    // Blocks until queued; dropping the sender first would close the stream cleanly.
    let _ = tx.send(UploadItem::Abort).await;
    Err(err)
}

const WRITE_PATH: &str = "/depot.v1.FileStore/Write";

/// One item of the upload stream.
#[derive(Debug)]
enum UploadItem {
    /// A protocol frame.
    Frame(WriteRequest),
    /// Fail the request body, which resets the HTTP/2 stream.
    Abort,
}

/// Codec for uploads: protobuf frames, plus an abort marker that fails to
/// encode on purpose.
#[derive(Debug, Clone, Copy, Default)]
struct UploadCodec;

type ResponseDecoder = <ProstCodec<WriteRequest, WriteResponse> as Codec>::Decoder;

impl Codec for UploadCodec {
    type Encode = UploadItem;
    type Decode = WriteResponse;
    type Encoder = UploadEncoder;
    type Decoder = ResponseDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        UploadEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        ProstCodec::<WriteRequest, WriteResponse>::default().decoder()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct UploadEncoder;

impl Encoder for UploadEncoder {
    type Item = UploadItem;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        match item {
            UploadItem::Frame(req) => req
                .encode(dst)
                .map_err(|e| Status::internal(format!("failed to encode frame: {e}"))),
            UploadItem::Abort => Err(Status::cancelled("upload aborted by client")),
        }
    }
}
