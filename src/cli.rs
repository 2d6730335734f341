use clap::{Parser, Subcommand};
use grail_access::humanize::ByteSize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "grail-fetch")]
#[command(about = "Fetch URLs through the Grail protocol layer", long_about = None)]
pub struct Cli {
    /// Preferences file (default: $GRAIL_CONFIG or config/grail.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch URLs; bodies go to stdout in argument order
    Get(GetArgs),
    /// Show how a URL would be routed, as JSON
    Proxy(ProxyArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(clap::Args, Debug)]
pub struct GetArgs {
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Read size per `getdata` call (e.g. 512, 8KB); overrides fetch.chunk_size
    #[arg(long)]
    pub chunk_size: Option<ByteSize>,

    /// Print status and headers before each body instead of on stderr
    #[arg(short, long)]
    pub include: bool,
}

#[derive(clap::Args, Debug)]
pub struct ProxyArgs {
    pub url: String,
}
