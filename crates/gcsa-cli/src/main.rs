use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use gcsa_collect::{
    check_secret_data, collect, init_metadata, CollectRequest, CollectStats, CollectorConfig,
    BUCKET_NAME_OPTION,
};
use gcsa_storage::{FsGateway, StorageGateway};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gcsa-cli")]
#[command(about = "GCS CSV asset collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the plugin init metadata.
    Init,
    /// List the datasets found in a bucket.
    Discover {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        secret_file: Option<PathBuf>,
    },
    /// Collect a bucket and print one envelope per line.
    Collect {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        secret_file: PathBuf,
    },
    Serve,
}

fn init_tracing(config: &CollectorConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn read_secret(path: &Path) -> Result<JsonMap<String, JsonValue>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading secret file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing secret file {}", path.display()))
}

async fn discovery_gateway(
    config: &CollectorConfig,
    secret_file: Option<&Path>,
) -> Result<Arc<dyn StorageGateway>> {
    if let Some(root) = &config.local_root {
        info!(root = %root.display(), "using local bucket root");
        return Ok(Arc::new(FsGateway::new(root.clone())));
    }
    let path = secret_file.context("--secret-file is required unless GCSA_LOCAL_ROOT is set")?;
    let key = check_secret_data(&read_secret(path).await?)?;
    Ok(config.gateway_factory().connect(&key)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let config = CollectorConfig::from_env();
    init_tracing(&config);

    let cli = Cli::parse();
    debug!(?cli, "parsed command line");

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Init => {
            println!("{}", serde_json::to_string_pretty(&init_metadata())?);
        }
        Commands::Discover {
            bucket,
            secret_file,
        } => {
            let gateway = discovery_gateway(&config, secret_file.as_deref()).await?;
            let datasets = gcsa_assets::discover(gateway.as_ref(), &bucket)
                .await
                .with_context(|| format!("listing bucket {bucket}"))?;
            info!(bucket = %bucket, datasets = datasets.len(), "discovery complete");
            println!("{}", serde_json::to_string_pretty(&datasets)?);
        }
        Commands::Collect {
            bucket,
            secret_file,
        } => {
            let mut options = JsonMap::new();
            options.insert(BUCKET_NAME_OPTION.to_string(), JsonValue::from(bucket.clone()));
            let request = CollectRequest {
                options,
                secret_data: read_secret(&secret_file).await?,
                schema: None,
            };

            info!(bucket = %bucket, "starting collect");
            let factory = config.gateway_factory();
            let mut envelopes = collect(request, factory.as_ref())?;
            let mut stats = CollectStats::default();
            while let Some(envelope) = envelopes.next().await {
                stats.record(&envelope);
                println!("{}", serde_json::to_string(&envelope)?);
            }
            eprintln!(
                "collect complete: bucket={} cloud_services={} cloud_service_types={} errors={}",
                bucket, stats.cloud_services, stats.cloud_service_types, stats.errors
            );
        }
        Commands::Serve => {
            gcsa_web::serve_from_env().await?;
        }
    }

    Ok(())
}
