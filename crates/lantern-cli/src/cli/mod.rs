//! CLI argument parsing and node lifecycle.

pub mod args;

use anyhow::{Context, Result};
use args::Cli;
use clap::Parser;
use lantern_node::{LoggingHandler, Node, NodeConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Run the CLI application.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cwd = std::env::current_dir().context("cannot read working directory")?;
    let config_dir = cli
        .resolve_config_dir(&cwd)
        .context("no config directory given and no home directory found")?;
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("cannot create {}", config_dir.display()))?;

    let mut config = NodeConfig::load(&config_dir)?;
    apply_overrides(&mut config, cli);
    config.validate()?;

    let node = Node::start(&config, Arc::new(LoggingHandler)).await?;
    info!(
        proxy = %node.proxy_addr(),
        control = %node.control_addr(),
        issuance = %node.issuance_addr(),
        "node running, ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for ctrl-c")?;
    node.shutdown();
    Ok(())
}

/// `RUST_LOG` wins; otherwise info, or debug with `-v`.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Command-line values override the file for this run only; they are not saved.
fn apply_overrides(config: &mut NodeConfig, cli: Cli) {
    if let Some(port) = cli.control_port {
        config.control_channel_port = port;
    }
    if let Some(port) = cli.proxy_port {
        config.local_proxy_port = port;
    }
    if let Some(host) = cli.proxy_host {
        config.local_proxy_host = Some(host);
    }
    if let Some(sponsor) = cli.sponsor {
        config.sponsor = Some(sponsor);
    }
}
