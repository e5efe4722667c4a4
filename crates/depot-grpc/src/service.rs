//! gRPC request handler for the FileStore service.

use std::pin::Pin;
use std::sync::Arc;

use depot::transfer::{self, Frame, MAX_FRAME_SIZE, UploadSession};
use depot::{Metrics, NoopMetrics, Operation, Storage};
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tonic::{Request, Response, Status, Streaming};

use crate::proto::{
    self, ListRequest, ListResponse, ReadRequest, ReadResponse, RemoveRequest, RemoveResponse,
    RenameRequest, RenameResponse, StatRequest, StatResponse, WriteRequest, WriteResponse,
    file_store_server::FileStoreServer,
};
use crate::status::{storage_status, transfer_status};

/// Frames buffered between the read task and the transport.
const READ_CHANNEL_DEPTH: usize = 4;

/// The FileStore gRPC service.
///
/// Owns the storage backend chosen at startup and an observability sink.
/// Each call is handled independently; the only ordering guarantees are the
/// frame order within one streaming call.
#[derive(Clone, Debug)]
pub struct StorageService {
    storage: Arc<dyn Storage>,
    metrics: Arc<dyn Metrics>,
    frame_size: usize,
}

impl StorageService {
    /// Create a service over `storage` with no metrics and the default frame cap.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            metrics: Arc::new(NoopMetrics),
            frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Report request counts to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Cap data frames, both sent and accepted, at `frame_size` bytes.
    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size.max(1);
        self
    }

    /// Wrap the service for a tonic router, bounding messages at
    /// `max_message_size` bytes in both directions.
    pub fn into_server(self, max_message_size: usize) -> FileStoreServer<Self> {
        FileStoreServer::new(self)
            .max_decoding_message_size(max_message_size)
            .max_encoding_message_size(max_message_size)
    }

    fn track(&self, op: Operation) -> RequestGuard {
        self.metrics.request_started(op);
        RequestGuard {
            metrics: Arc::clone(&self.metrics),
            op,
            ok: false,
        }
    }
}

/// Reports the end of a request when dropped, as a failure unless marked
/// otherwise. Dropped handler futures (cancelled calls) count as failures.
struct RequestGuard {
    metrics: Arc<dyn Metrics>,
    op: Operation,
    ok: bool,
}

impl RequestGuard {
    fn succeed(mut self) {
        self.ok = true;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.metrics.request_finished(self.op, self.ok);
    }
}

fn require_name(name: &str, what: &str) -> Result<(), Status> {
    if name.is_empty() {
        return Err(Status::invalid_argument(format!("missing {what}")));
    }
    Ok(())
}

type ReadStream = Pin<Box<dyn Stream<Item = Result<ReadResponse, Status>> + Send>>;

#[tonic::async_trait]
impl proto::file_store_server::FileStore for StorageService {
    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        let guard = self.track(Operation::Write);
        let mut stream = request.into_inner();

        // The name arrives first; nothing else can be checked before it.
        let first = match stream.message().await? {
            Some(msg) => Frame::try_from(msg)?,
            None => return Err(Status::invalid_argument("stream closed before file name")),
        };
        let mut session = UploadSession::begin(first, self.frame_size).map_err(transfer_status)?;
        require_name(session.name(), "file name")?;

        let name = session.name().to_string();
        tracing::info!(name = %name, "Handling write request");

        // Reject before any data is consumed.
        if self
            .storage
            .exists(&name)
            .await
            .map_err(|e| storage_status(Operation::Write, e))?
        {
            return Err(Status::already_exists(format!("file {name} already exists")));
        }

        while let Some(msg) = stream.message().await.inspect_err(|e| {
            tracing::warn!(name = %name, "Upload aborted after {} bytes: {}", session.bytes_received(), e);
        })? {
            let n = session
                .accept(Frame::try_from(msg)?)
                .map_err(transfer_status)?;
            self.metrics.bytes_received(n as u64);
            tracing::debug!(name = %name, "Received {} bytes of data", n);
        }

        let received = session.bytes_received();
        // A reset or dropped client can look like a clean end of stream.
        let (name, data) = session.finish().map_err(|e| {
            tracing::warn!(name = %name, "Upload ended uncommitted after {} bytes", received);
            transfer_status(e)
        })?;
        tracing::debug!(name = %name, "Upload committed: {} bytes", received);

        let stored = self
            .storage
            .write(&name, &data)
            .await
            .map_err(|e| storage_status(Operation::Write, e))?;
        drop(data);
        transfer::check_size(received, stored).map_err(transfer_status)?;

        guard.succeed();
        tracing::info!(name = %name, "Successfully handled write request");
        Ok(Response::new(WriteResponse { size: stored }))
    }

    type ReadStream = ReadStream;

    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        let guard = self.track(Operation::Read);
        let name = request.into_inner().name;
        require_name(&name, "file name")?;
        tracing::info!(name = %name, "Handling read request");

        let data = self
            .storage
            .read(&name)
            .await
            .map_err(|e| storage_status(Operation::Read, e))?;

        let (tx, rx) = mpsc::channel::<Result<ReadResponse, Status>>(READ_CHANNEL_DEPTH);
        let metrics = Arc::clone(&self.metrics);
        let frame_size = self.frame_size;

        tokio::spawn(async move {
            let total = data.len();
            let mut sent = 0usize;
            for chunk in transfer::chunks(&data, frame_size) {
                let frame = ReadResponse {
                    data: chunk.to_vec(),
                };
                // Fails once the client has gone away.
                if tx.send(Ok(frame)).await.is_err() {
                    tracing::warn!(name = %name, "Client went away after {} of {} bytes", sent, total);
                    return;
                }
                sent += chunk.len();
                metrics.bytes_sent(chunk.len() as u64);
                tracing::debug!(name = %name, "Sent {} bytes of data", chunk.len());
            }
            guard.succeed();
            tracing::info!(name = %name, "Successfully handled read request");
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::ReadStream))
    }

    async fn list(&self, _request: Request<ListRequest>) -> Result<Response<ListResponse>, Status> {
        let guard = self.track(Operation::List);
        tracing::info!("Handling list request");

        let files = self
            .storage
            .list()
            .await
            .map_err(|e| storage_status(Operation::List, e))?;

        guard.succeed();
        tracing::info!("Successfully handled list request");
        Ok(Response::new(ListResponse { files }))
    }

    async fn stat(&self, request: Request<StatRequest>) -> Result<Response<StatResponse>, Status> {
        let guard = self.track(Operation::Stat);
        let name = request.into_inner().name;
        require_name(&name, "file name")?;
        tracing::info!(name = %name, "Handling stat request");

        let info = self
            .storage
            .stat(&name)
            .await
            .map_err(|e| storage_status(Operation::Stat, e))?;

        guard.succeed();
        tracing::info!(name = %name, "Successfully handled stat request");
        Ok(Response::new(StatResponse {
            file_info: Some(info.into()),
        }))
    }

    async fn rename(
        &self,
        request: Request<RenameRequest>,
    ) -> Result<Response<RenameResponse>, Status> {
        let guard = self.track(Operation::Rename);
        let RenameRequest { old, new } = request.into_inner();
        require_name(&old, "old file name")?;
        require_name(&new, "new file name")?;
        tracing::info!(old = %old, new = %new, "Handling rename request");

        self.storage
            .rename(&old, &new)
            .await
            .map_err(|e| storage_status(Operation::Rename, e))?;

        guard.succeed();
        tracing::info!(old = %old, new = %new, "Successfully handled rename request");
        Ok(Response::new(RenameResponse {}))
    }

    async fn remove(
        &self,
        request: Request<RemoveRequest>,
    ) -> Result<Response<RemoveResponse>, Status> {
        let guard = self.track(Operation::Remove);
        let name = request.into_inner().name;
        require_name(&name, "file name")?;
        tracing::info!(name = %name, "Handling remove request");

        self.storage
            .remove(&name)
            .await
            .map_err(|e| storage_status(Operation::Remove, e))?;

        guard.succeed();
        tracing::info!(name = %name, "Successfully handled remove request");
        Ok(Response::new(RemoveResponse {}))
    }
}
