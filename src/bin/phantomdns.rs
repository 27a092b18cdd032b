use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use phantomdns::config::{Settings, default_config_path};
use phantomdns::server::DnsRouter;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "phantomdns", version, about = "PhantomDNS query router", long_about = None)]
struct Args {
    /// Override path to the runtime config (phantomdns.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the DNS listen address from the config
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Increase logging verbosity
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        "phantomdns=debug"
    } else {
        "phantomdns=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut settings = Settings::load_or_default(&config_path)?;

    if let Some(listen) = args.listen {
        settings.server.listen = listen;
    }

    let router = DnsRouter::new(settings)?;
    info!(config = %config_path.display(), "Starting PhantomDNS");
    router.run().await
}
