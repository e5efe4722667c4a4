//! Server configuration and runner.

use std::future::Future;
use std::sync::Arc;

use depot::{Counters, StorageError};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

use crate::config::{ConfigError, ServerConfig};
use crate::service::StorageService;

/// Errors that stop a server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The storage backend could not be opened.
    #[error("failed to open storage: {0}")]
    Storage(#[from] StorageError),
    /// The listen address could not be bound.
    #[error("failed to listen: {0}")]
    Bind(#[source] std::io::Error),
    /// The transport failed while serving.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// A FileStore server for one backend.
#[derive(Debug)]
pub struct DepotServer {
    config: ServerConfig,
    counters: Arc<Counters>,
}

impl DepotServer {
    /// Validate `config` and prepare a server.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self {
            config,
            counters: Arc::new(Counters::new()),
        })
    }

    /// Request counters, live while the server runs.
    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// Bind the configured address and serve until Ctrl+C or SIGTERM.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.addr)
            .await
            .map_err(ServerError::Bind)?;
        self.serve_with_shutdown(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `signal` resolves, then close the backend.
    pub async fn serve_with_shutdown<F>(
        self,
        listener: TcpListener,
        signal: F,
    ) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let frame_size = self.config.frame_size()?;
        let addr = listener.local_addr().map_err(ServerError::Bind)?;

        tracing::info!(
            id = %self.config.id,
            os = std::env::consts::OS,
            arch = std::env::consts::ARCH,
            backend = %self.config.backend,
            "Starting gRPC server on {}",
            addr
        );

        let storage = self.config.backend.open().await?;
        let service = StorageService::new(Arc::clone(&storage))
            .with_metrics(self.counters.clone())
            .with_frame_size(frame_size);

        let mut builder = tonic::transport::Server::builder();
        if let Some(timeout) = self.config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let served = builder
            .add_service(service.into_server(self.config.max_message_size))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await;

        if let Err(e) = storage.close().await {
            tracing::warn!("Failed to close storage: {}", e);
        }
        let totals = self.counters.snapshot();
        tracing::info!(
            total = totals.total,
            failed = totals.failed,
            bytes_received = totals.bytes_received,
            bytes_sent = totals.bytes_sent,
            "gRPC server shut down"
        );
        served.map_err(ServerError::from)
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::warn!("Received Ctrl+C, exiting gracefully");
        }
        _ = terminate => {
            tracing::warn!("Received SIGTERM, exiting gracefully");
        }
    }
}
