use anyhow::Result;
use clap::Parser;
use ff_jewel_pipeline::{aggregate, build_http_client, Estimator, Store, TrackerConfig};
use tracing::info;

/// Aggregate recent listings into per-node price snapshots.
#[derive(Parser, Debug)]
#[command(name = "collect_stats")]
struct Args {
    /// Window-price strategy: cluster, stddev or mad
    #[arg(long, default_value = "cluster")]
    estimator: Estimator,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = TrackerConfig::from_env()?;

    info!("📊 Starting aggregation run ({:?})", args.estimator);

    let client = build_http_client()?;
    let store = Store::connect(&config.db_connstr).await?;

    aggregate::run(&client, &store, &config, args.estimator).await?;

    info!("✅ Aggregation complete");
    Ok(())
}
