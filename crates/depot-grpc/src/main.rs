//! Depot gRPC Server
//!
//! Serves one storage backend over the FileStore gRPC service.

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use depot_grpc::{DepotServer, ServerArgs};

/// Depot gRPC Server - named-file storage over gRPC
#[derive(Parser, Debug)]
#[command(name = "depot-server")]
#[command(about = "gRPC server storing named files in a directory or in memory")]
struct Args {
    #[command(flatten)]
    server: ServerArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let server = DepotServer::new(args.server.into_config()?)?;
    server.run().await?;

    Ok(())
}
