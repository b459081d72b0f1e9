use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;

use muster_core::ComposeDoc;
use muster_directory::{ClientSet, ConnectOptions};

#[derive(Parser, Debug)]
#[command(name = "musterctl", version, about = "Create remote resources from a compose file")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the resources described by a compose file
    Up {
        /// Path to the compose file
        #[arg(short = 'f', long = "file", default_value = "./muster.yml")]
        file: PathBuf,

        /// API token used to authenticate against the server
        #[arg(long = "token", env = "MUSTER_TOKEN")]
        token: String,

        /// CA certificate file for the server
        #[arg(long = "cacert-file")]
        cacert_file: Option<PathBuf>,

        /// Skip TLS verification when connecting
        #[arg(long = "insecure-skip-tls", action = ArgAction::SetTrue)]
        insecure_skip_tls: bool,

        /// Server URL
        #[arg(long = "url", default_value = "https://localhost:8443/v3")]
        url: String,
    },
}

fn init_tracing() {
    let env = std::env::var("MUSTER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MUSTER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MUSTER_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Up { file, token, cacert_file, insecure_skip_tls, url } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let doc = ComposeDoc::parse(&text)?;
            if doc.is_empty() {
                info!("nothing to create");
                return Ok(());
            }
            let cacert_pem = match &cacert_file {
                Some(path) => Some(
                    std::fs::read_to_string(path)
                        .with_context(|| format!("reading {}", path.display()))?,
                ),
                None => None,
            };
            let opts = ConnectOptions { url, token, cacert_pem, insecure_skip_tls };
            let set = ClientSet::connect(&opts).await?;
            muster_up::up(&set, &doc).await
        }
    }
}
