//! tftpd - Main executable
//!
//! Runs every TFTP server described in a JSON configuration file until
//! interrupted.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use argh::FromArgs;
use tftpd::{App, AppConfig};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "tftpd.json";

#[derive(FromArgs, Debug)]
#[argh(
    description = "tftpd - multi-instance TFTP file server",
    example = "Run the servers in ./tftpd.json:\n  {command_name}",
    example = "Serve relative roots from /srv/tftp:\n  {command_name} --config /etc/tftpd.json --root /srv/tftp",
    example = "Validate a configuration without binding:\n  {command_name} --config /etc/tftpd.json --check"
)]
struct CliConfig {
    #[argh(
        option,
        short = 'c',
        description = "configuration file",
        default = "PathBuf::from(DEFAULT_CONFIG)"
    )]
    config: PathBuf,

    #[argh(
        option,
        short = 'r',
        description = "base directory for empty and relative roots (default: working directory)"
    )]
    root: Option<PathBuf>,

    #[argh(switch, description = "emit logs as JSON lines")]
    json: bool,

    #[argh(switch, description = "validate the configuration and exit")]
    check: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Directory that empty and relative roots are resolved against.
fn base_root(root: Option<&Path>) -> Result<PathBuf> {
    match root {
        Some(root) => std::path::absolute(root).with_context(|| format!("Invalid root {}", root.display())),
        None => std::env::current_dir().context("Failed to determine working directory"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: CliConfig = argh::from_env();
    init_logging(cli.json);

    let base = base_root(cli.root.as_deref())?;

    let config = AppConfig::load(&cli.config)
        .await
        .context("Failed to load configuration")?
        .with_default_root(&base);

    let mut app = App::provision(&config).context("Failed to provision tftp servers")?;
    if cli.check {
        println!("{}: OK ({} instance(s))", cli.config.display(), app.instances().len());
        return Ok(());
    }

    app.start().await.context("Failed to start tftp servers")?;
    tracing::info!("tftpd running; press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    app.stop().await.context("tftp servers did not stop cleanly")?;
    Ok(())
}
