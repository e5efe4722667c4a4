//! Depot gRPC service and client.
//!
//! Exposes a [`Storage`](depot::Storage) backend over the `depot.v1.FileStore`
//! gRPC service. Uploads are client-streaming and downloads server-streaming,
//! both carrying the chunked frames defined in [`depot::transfer`]; the other
//! operations are unary.
//!
//! # Example Flow
//!
//! ```text
//! Client                                    Server
//! │                                           │
//! │  WriteRequest{name: "a.txt"}              │
//! │ ─────────────────────────────────────────>│ stat("a.txt") must fail NotFound
//! │  WriteRequest{data: <= frame cap}  x N    │
//! │ ─────────────────────────────────────────>│ accumulate
//! │  WriteRequest{commit: 11}                 │
//! │ ─────────────────────────────────────────>│ check total
//! │  <end of stream>                          │
//! │ ─────────────────────────────────────────>│ write("a.txt", buffer)
//! │                                           │
//! │       WriteResponse{size: 11}             │
//! │<───────────────────────────────────────── │
//! ```

pub mod proto {
    #![allow(missing_docs)]
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("depot.v1");
}

mod client;
mod config;
mod convert;
mod server;
mod service;
mod status;

pub use client::{ClientError, ClientOptions, DepotClient};
pub use config::{ConfigError, ServerArgs, ServerConfig};
pub use server::{DepotServer, ServerError, shutdown_signal};
pub use service::StorageService;

// Re-export proto types for convenience
pub use proto::{
    WriteRequest, file_store_client::FileStoreClient,
    file_store_server::FileStoreServer as FileStoreGrpcServer,
};
