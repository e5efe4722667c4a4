//! Depot CLI
//!
//! Usage:
//!   depot write --name report.pdf [--as q3.pdf]   Upload a local file
//!   depot read --name q3.pdf [--to out.pdf]       Download a stored file
//!   depot list                                    Stored names, as JSON
//!   depot stat --name q3.pdf                      File attributes, as JSON
//!   depot rename --old q3.pdf --new q4.pdf
//!   depot remove --name q4.pdf
//!   depot server --path /srv/depot                Run a server
//!
//! Client commands talk to `--target` (default `http://127.0.0.1:8080`).
//! Ctrl+C cancels the operation in flight.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use depot_grpc::{ClientOptions, DepotClient, DepotServer, ServerArgs, shutdown_signal};

/// Depot - store and fetch named files over gRPC
#[derive(Parser, Debug)]
#[command(name = "depot")]
#[command(about = "Client and server for the Depot file store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file
    Write {
        #[command(flatten)]
        target: Target,
        /// Local file to upload
        #[arg(long)]
        name: PathBuf,
        /// Remote name; defaults to the local file name
        #[arg(long = "as")]
        remote: Option<String>,
    },
    /// Download a stored file
    Read {
        #[command(flatten)]
        target: Target,
        /// Remote file name
        #[arg(long)]
        name: String,
        /// Local destination; defaults to the remote name
        #[arg(long)]
        to: Option<PathBuf>,
    },
    /// List stored files
    List {
        #[command(flatten)]
        target: Target,
    },
    /// Show a stored file's attributes
    Stat {
        #[command(flatten)]
        target: Target,
        /// Remote file name
        #[arg(long)]
        name: String,
    },
    /// Rename a stored file
    Rename {
        #[command(flatten)]
        target: Target,
        /// Current name
        #[arg(long)]
        old: String,
        /// New name
        #[arg(long)]
        new: String,
    },
    /// Delete a stored file
    Remove {
        #[command(flatten)]
        target: Target,
        /// Remote file name
        #[arg(long)]
        name: String,
    },
    /// Run a server
    Server(ServerArgs),
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Server to talk to
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    target: String,
}

impl Target {
    async fn connect(self, cancel: CancellationToken) -> anyhow::Result<DepotClient> {
        let options = ClientOptions {
            cancel,
            ..ClientOptions::default()
        };
        DepotClient::connect(self.target.clone(), options)
            .await
            .with_context(|| format!("cannot reach {}", self.target))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    match cli.command {
        Command::Write {
            target,
            name,
            remote,
        } => {
            let client = target.connect(cancel).await?;
            let size = match remote {
                Some(remote) => client.upload_as(&name, &remote).await,
                None => client.upload(&name).await,
            }
            .with_context(|| format!("failed to write {}", name.display()))?;
            tracing::info!("Wrote {} bytes from {}", size, name.display());
        }
        Command::Read { target, name, to } => {
            let client = target.connect(cancel).await?;
            let dst = to.unwrap_or_else(|| PathBuf::from(&name));
            let size = client
                .download(&name, &dst)
                .await
                .with_context(|| format!("failed to read {name}"))?;
            tracing::info!("Read {} bytes into {}", size, dst.display());
        }
        Command::List { target } => {
            let client = target.connect(cancel).await?;
            let files = client.list().await.context("failed to list files")?;
            println!("{}", serde_json::to_string_pretty(&files)?);
        }
        Command::Stat { target, name } => {
            let client = target.connect(cancel).await?;
            let info = client
                .stat(&name)
                .await
                .with_context(|| format!("failed to stat {name}"))?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Rename { target, old, new } => {
            let client = target.connect(cancel).await?;
            client
                .rename(&old, &new)
                .await
                .with_context(|| format!("failed to rename {old} to {new}"))?;
            tracing::info!("Renamed {} to {}", old, new);
        }
        Command::Remove { target, name } => {
            let client = target.connect(cancel).await?;
            client
                .remove(&name)
                .await
                .with_context(|| format!("failed to remove {name}"))?;
            tracing::info!("Removed {}", name);
        }
        Command::Server(args) => {
            // The server watches for shutdown signals itself.
            let server = DepotServer::new(args.into_config()?)?;
            server.run().await?;
        }
    }

    Ok(())
}
