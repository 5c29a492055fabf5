use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "trendmill-stitch",
    version,
    about = "Stitch overlapping trend fragments into one normalized series per location"
)]
pub struct Cli {
    /// Keyword id to stitch.
    #[arg(value_name = "KEYWORD_ID", default_value_t = 1)]
    pub keyword: i64,

    /// Request queue database to read fragments from.
    #[arg(long, env = "TRENDMILL_DB", default_value = "trendmill.db")]
    pub db: PathBuf,

    /// Analytics database to write.
    #[arg(long, env = "TRENDMILL_TS_DB", default_value = "time_series.db")]
    pub out: PathBuf,
}
