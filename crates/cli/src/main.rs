//! Operator CLI for tusblob uploads.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tusblob_core::{AppConfig, UploadId};
use tusblob_ingest::{TusStore, UploadStore};

/// tusblob - durable resumable uploads on append-only object storage
#[derive(Parser, Debug)]
#[command(name = "tusblob")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "TUSBLOB_CONFIG",
        default_value = "config/tusblob.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an upload and print its id
    Create {
        /// Declared total length in bytes
        #[arg(long)]
        length: u64,
        /// Opaque metadata stored with the upload
        #[arg(long, default_value = "")]
        metadata: String,
    },
    /// Append a file (or `-` for stdin) to an upload
    Append {
        id: UploadId,
        /// Source file, or `-` to read stdin
        source: String,
    },
    /// Show offset, length, state and metadata of an upload
    Status { id: UploadId },
    /// Write the committed bytes of an upload
    Fetch {
        id: UploadId,
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Exit with status 0 if the upload exists, 1 otherwise
    Exists { id: UploadId },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Stdout carries command output; logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli.config)?;
    let store = UploadStore::from_config(&config)
        .await
        .context("failed to initialize upload store")?;

    store
        .objects()
        .create_if_missing()
        .await
        .context("failed to prepare object storage")?;
    store
        .objects()
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(
        backend = store.objects().backend_name(),
        "Storage backend connectivity verified"
    );

    let reclaimed = store
        .reclaim_staging()
        .await
        .context("failed to reclaim staging directory")?;
    if reclaimed > 0 {
        tracing::warn!(reclaimed, "Removed leftover staging directories");
    }

    match cli.command {
        Commands::Create { length, metadata } => {
            let id = store.create_upload(length, &metadata).await?;
            println!("{id}");
        }
        Commands::Append { id, source } => {
            let written = append(&store, &id, &source).await?;
            let offset = store.get_offset(&id).await?;
            let length = store.get_length(&id).await?;
            println!("wrote {written} bytes ({offset}/{length})");
        }
        Commands::Status { id } => {
            let attributes = store.attributes(&id).await?;
            println!("id:       {id}");
            println!("state:    {}", attributes.state());
            println!("offset:   {}", attributes.offset);
            println!("length:   {}", attributes.upload_length);
            println!("metadata: {}", attributes.metadata);
        }
        Commands::Fetch { id, output } => {
            let bytes = fetch(&store, &id, output.as_deref()).await?;
            tracing::info!(upload_id = %id, bytes, "Fetched upload content");
        }
        Commands::Exists { id } => {
            if !store.exists(&id).await? {
                println!("no");
                return Ok(ExitCode::FAILURE);
            }
            println!("yes");
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Load configuration: optional TOML file, then `TUSBLOB_` environment overrides.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();

    if Path::new(path).exists() {
        tracing::debug!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("TUSBLOB_").ignore(&["CONFIG"]).split("__"))
        .extract()
        .context("failed to load configuration")?;

    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn append(store: &UploadStore, id: &UploadId, source: &str) -> Result<u64> {
    let mut body: Box<dyn AsyncRead + Unpin + Send> = if source == "-" {
        Box::new(tokio::io::stdin())
    } else {
        let file = tokio::fs::File::open(source)
            .await
            .with_context(|| format!("failed to open {source}"))?;
        Box::new(file)
    };

    // Ctrl-C stops reading; staged chunks are still committed
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing staged chunks");
            trigger.cancel();
        }
    });

    let result = store.append_data(id, body.as_mut(), &cancel).await;
    watcher.abort();

    result.with_context(|| format!("append to {id} failed"))
}

async fn fetch(store: &UploadStore, id: &UploadId, output: Option<&Path>) -> Result<u64> {
    let mut stream = store.fetch_readable_content(id).await?;
    let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut total = 0;
    while let Some(part) = stream.next().await {
        let part = part.with_context(|| format!("failed to read {id}"))?;
        sink.write_all(&part).await?;
        total += part.len() as u64;
    }
    sink.flush().await?;
    Ok(total)
}
