//! Market-data pipeline for Forbidden Flame / Forbidden Flesh jewel
//! listings.
//!
//! This library provides:
//! - a river consumer that follows the public stash-tab stream under the
//!   upstream's advertised rate limits, with head-drift sampling
//! - a streaming extractor that pulls target jewels out of multi-megabyte
//!   responses without buffering them
//! - a transactional reconciliation engine that keeps the listings table
//!   equal to the latest-seen state of every touched stash
//! - an offline aggregator deriving robust per-node price summaries via
//!   hierarchical clustering

use std::time::Duration;

pub mod aggregate;
pub mod clustering;
pub mod config;
pub mod cursor;
pub mod error;
pub mod ninja;
pub mod price;
pub mod rate_limit;
pub mod reconcile;
pub mod river;
pub mod stash_stream;
pub mod store;

// Re-export main types for convenience
pub use aggregate::{Estimator, PriceSummary};
pub use clustering::{cluster_prices, hcluster, DendrogramStratum, Linkage};
pub use config::TrackerConfig;
pub use error::PipelineError;
pub use price::Price;
pub use reconcile::{plan, ReconcilePlan};
pub use river::RiverConsumer;
pub use stash_stream::{extract_stashes, JewelEntry, JewelType, StashSnapshot};
pub use store::Store;

/// Build the process-wide HTTP client shared by every upstream call.
pub fn build_http_client() -> Result<reqwest::Client, PipelineError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(Into::into)
}
