use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Courier HTTP request runner", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $COURIER_CONFIG or config/courier.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Issue one request and print the response body
    Get(GetArgs),
    /// Run requests concurrently as a batch
    Batch(GroupArgs),
    /// Run requests one after another as a chain
    Chain(GroupArgs),
}

#[derive(clap::Args, Debug)]
pub struct GetArgs {
    /// Path relative to the base URL, or an absolute URL
    pub path: String,

    /// Cache the response for this many seconds and preview it next time
    #[arg(long)]
    pub cache_ttl: Option<i64>,

    /// Number of retries after the first attempt (negative: unlimited)
    #[arg(long)]
    pub retry: Option<i32>,

    /// Delay between attempts
    #[arg(long, default_value_t = 1000)]
    pub retry_interval_ms: u64,

    /// Stream the body to this file (resumable)
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct GroupArgs {
    /// Request paths
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Keep going after a failed request
    #[arg(long)]
    pub keep_going: bool,
}
