use clap::Parser;
use pgshard_server::Config;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Parser)]
#[command(name = "pgshard", version, about = "Sharding connection pooler for Postgres")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "pgshard.toml")]
    config: String,
    /// trace, debug, info, warn or error.
    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::from_path(&args.config)?;
    pgshard_server::run(config).await
}
