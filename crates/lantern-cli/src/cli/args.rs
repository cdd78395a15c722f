//! Command-line argument definitions using clap.

use clap::Parser;
use lantern_node::SponsorAddress;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Lantern peer node
///
/// Serves a local HTTP(S) proxy and a mutually authenticated control channel.
/// Give a sponsor to have it sign this node's certificate at startup.
#[derive(Parser, Debug)]
#[command(name = "lantern")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration directory (default: ~/.lantern)
    pub config_dir: Option<PathBuf>,

    /// Control channel port; the issuance listener takes the next one
    #[arg(long, env = "LANTERN_CONTROL_PORT")]
    pub control_port: Option<u16>,

    /// Local proxy port
    #[arg(long, env = "LANTERN_PROXY_PORT")]
    pub proxy_port: Option<u16>,

    /// Local proxy bind address
    #[arg(long)]
    pub proxy_host: Option<IpAddr>,

    /// Sponsor control channel address, as host:port
    #[arg(short, long)]
    pub sponsor: Option<SponsorAddress>,

    /// Increase verbosity
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Config directory as an absolute path. Relative paths resolve against `cwd`.
    pub fn resolve_config_dir(&self, cwd: &Path) -> Option<PathBuf> {
        match &self.config_dir {
            Some(dir) if dir.is_absolute() => Some(dir.clone()),
            Some(dir) => Some(cwd.join(dir)),
            None => lantern_node::NodeConfig::default_dir(),
        }
    }
}
