use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "trendmill-dispatch", version, about = "trendmill queue dispatcher")]
pub struct Cli {
    /// Request queue database.
    #[arg(long, env = "TRENDMILL_DB", default_value = "trendmill.db")]
    pub db: PathBuf,

    /// Use a single in-process transport running the fetch script and
    /// ignore the transport config.
    #[arg(long)]
    pub local: bool,

    /// Fetch script used with `--local`.
    #[arg(long, env = "TRENDMILL_FETCH_SCRIPT", default_value = "./fetch_trends")]
    pub script: PathBuf,

    /// Transport descriptor file (ignored with `--local`).
    #[arg(long, env = "TRENDMILL_TRANSPORTS", default_value = "transports.json")]
    pub transports: PathBuf,

    /// Exit cleanly once the queue drains.
    #[arg(long)]
    pub exit: bool,
}
