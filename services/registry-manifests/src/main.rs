//! Registry server

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr;
use registry_manifests::{LogFormat, RegistryConfig};
use tracing_subscriber::EnvFilter;

/// Serve container image manifests over the registry HTTP API.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Utf8PathBuf,

    /// Listen on this address instead of the configured one
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();

    let document = tokio::fs::read_to_string(&args.config)
        .await
        .wrap_err_with(|| format!("reading {}", args.config))?;
    let mut config = RegistryConfig::from_toml(&document)
        .wrap_err_with(|| format!("parsing {}", args.config))?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    init_tracing(config.log_format);

    let registry = config
        .builder()
        .await
        .wrap_err("building storage backend")?
        .build();

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .wrap_err_with(|| format!("binding {}", config.bind))?;
    tracing::info!(addr = %config.bind, "registry listening");

    axum::serve(listener, registry)
        .await
        .wrap_err("serving registry")?;
    Ok(())
}
