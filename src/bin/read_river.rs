use anyhow::Result;
use clap::Parser;
use ff_jewel_pipeline::{build_http_client, RiverConsumer, Store, TrackerConfig};
use tracing::info;

/// Follow the public stash-tab river and keep the jewel listings current.
#[derive(Parser, Debug)]
#[command(name = "read_river")]
struct Args {
    /// Bootstrap from the current river head instead of the persisted cursor
    #[arg(long = "startFromHead")]
    start_from_head: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = TrackerConfig::from_env()?;

    info!("🌊 Starting river consumer");

    let client = build_http_client()?;
    let store = Store::connect(&config.db_connstr).await?;

    let consumer = RiverConsumer::new(client, store, config, args.start_from_head).await?;
    consumer.run().await?;

    Ok(())
}
