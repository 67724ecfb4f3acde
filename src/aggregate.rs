//! Offline price aggregation: convert recent listings to chaos, bucket them
//! per (league, type, class, node), and derive a robust window price plus a
//! five-number summary for each bucket.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{Duration, Utc};
use futures_util::TryStreamExt;
use reqwest::Client;
use sqlx::types::Json;
use tracing::{debug, info};

use crate::clustering::{self, Linkage};
use crate::config::TrackerConfig;
use crate::error::PipelineError;
use crate::ninja;
use crate::store::{JewelRow, Store};

/// How far back listings still count as current.
const WINDOW_HOURS: i64 = 48;

/// Robust window-price strategy. Clustering is the production default; the
/// filter-based estimators are kept selectable for comparison runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Estimator {
    ClusterWindow,
    StddevFilter,
    MadFilter,
}

impl FromStr for Estimator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster" => Ok(Estimator::ClusterWindow),
            "stddev" => Ok(Estimator::StddevFilter),
            "mad" => Ok(Estimator::MadFilter),
            other => Err(format!(
                "unknown estimator {other:?} (expected cluster, stddev or mad)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct BucketKey {
    league: String,
    jewel_type: String,
    jewel_class: String,
    allocated_node: String,
}

/// Per-bucket output row.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSummary {
    /// min, q1, median, q3, max.
    pub boxplot: [f64; 5],
    pub stddev: f64,
    pub window_price: f64,
    pub confidence: f64,
    pub num_listed: usize,
}

/// Run one aggregation pass: one snapshot-set row per league with listings,
/// one snapshot row per bucket, all inside a single transaction.
pub async fn run(
    client: &Client,
    store: &Store,
    config: &TrackerConfig,
    estimator: Estimator,
) -> Result<(), PipelineError> {
    if config.leagues.is_empty() {
        return Err(PipelineError::Config(
            "LEAGUES must name at least one active league".to_string(),
        ));
    }

    // one fetch per league per invocation
    let mut rates_by_league: HashMap<String, HashMap<String, f64>> = HashMap::new();
    for league in &config.leagues {
        let rates = ninja::exchange_rates(client, league).await?;
        info!("fetched {} exchange rates for {league}", rates.len());
        rates_by_league.insert(league.clone(), rates);
    }

    let cutoff = Utc::now() - Duration::hours(WINDOW_HOURS);

    let mut buckets: BTreeMap<BucketKey, Vec<f64>> = BTreeMap::new();
    // currency -> rate, per league, restricted to rates a listing actually used
    let mut used_rates: HashMap<String, HashMap<String, f64>> = HashMap::new();
    let mut listings: u64 = 0;
    let mut dropped: u64 = 0;

    {
        let mut rows = sqlx::query_as::<_, JewelRow>(
            "SELECT id, jewel_type, jewel_class, allocated_node, item_id, stash_id, league, \
             list_price_amount, list_price_currency, last_change_id, recorded_at \
             FROM jewels WHERE recorded_at > $1 AND league = ANY($2)",
        )
        .bind(cutoff)
        .bind(&config.leagues)
        .fetch(store.pool());

        while let Some(row) = rows.try_next().await? {
            listings += 1;

            let rates = match rates_by_league.get(&row.league) {
                Some(rates) => rates,
                None => {
                    dropped += 1;
                    continue;
                }
            };

            let (chaos, rate) =
                match chaos_value(row.list_price_amount, &row.list_price_currency, rates) {
                    Some(converted) => converted,
                    None => {
                        dropped += 1;
                        continue;
                    }
                };

            used_rates
                .entry(row.league.clone())
                .or_default()
                .insert(row.list_price_currency.clone(), rate);

            let bucket = buckets
                .entry(BucketKey {
                    league: row.league,
                    jewel_type: row.jewel_type,
                    jewel_class: row.jewel_class,
                    allocated_node: row.allocated_node,
                })
                .or_default();
            let at = bucket.partition_point(|&p| p <= chaos);
            bucket.insert(at, chaos);
        }
    }

    info!(
        "bucketed {} listings into {} buckets ({} dropped)",
        listings - dropped,
        buckets.len(),
        dropped
    );

    let generated_at = Utc::now();
    let mut tx = store.pool().begin().await?;

    let mut set_ids: HashMap<&str, i64> = HashMap::new();
    for league in &config.leagues {
        if !buckets.keys().any(|k| k.league == *league) {
            continue;
        }
        let frozen = used_rates.remove(league).unwrap_or_default();
        let (set_id,): (i64,) = sqlx::query_as(
            "INSERT INTO snapshot_sets (league, exchange_rates, generated_at) \
             VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(league)
        .bind(Json(&frozen))
        .bind(generated_at)
        .fetch_one(&mut *tx)
        .await?;
        set_ids.insert(league.as_str(), set_id);
    }

    let mut written = 0usize;
    for (key, prices) in &buckets {
        let set_id = match set_ids.get(key.league.as_str()) {
            Some(id) => *id,
            None => continue,
        };

        let summary = summarize(prices, estimator, config.min_inlier_cluster_size);
        debug!(
            "{}/{}|{}|{}: window {} from {} listings",
            key.league,
            key.jewel_type,
            key.jewel_class,
            key.allocated_node,
            summary.window_price,
            summary.num_listed
        );

        sqlx::query(
            "INSERT INTO snapshots \
             (set_id, jewel_type, jewel_class, allocated_node, min_price, first_quartile_price, \
              median_price, third_quartile_price, max_price, window_price, confidence, stddev, \
              num_listed, generated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(set_id)
        .bind(&key.jewel_type)
        .bind(&key.jewel_class)
        .bind(&key.allocated_node)
        .bind(summary.boxplot[0])
        .bind(summary.boxplot[1])
        .bind(summary.boxplot[2])
        .bind(summary.boxplot[3])
        .bind(summary.boxplot[4])
        .bind(summary.window_price)
        .bind(summary.confidence)
        .bind(summary.stddev)
        .bind(summary.num_listed as i32)
        .bind(generated_at)
        .execute(&mut *tx)
        .await?;
        written += 1;
    }

    tx.commit().await?;
    info!(
        "wrote {} snapshots across {} snapshot sets",
        written,
        set_ids.len()
    );
    Ok(())
}

/// Convert a listing price to whole chaos. Returns the floored value and the
/// applied rate, or `None` when the currency is unknown or the value floors
/// to zero.
fn chaos_value(
    amount: f64,
    currency: &str,
    rates: &HashMap<String, f64>,
) -> Option<(f64, f64)> {
    let (raw, rate) = if currency == "chaos" {
        (amount, 1.0)
    } else {
        let rate = *rates.get(currency)?;
        (amount * rate, rate)
    };

    let floored = raw.floor();
    if floored <= 0.0 {
        return None;
    }
    Some((floored, rate))
}

/// Summarize one bucket's sorted price vector.
pub fn summarize(sorted: &[f64], estimator: Estimator, min_cluster_size: usize) -> PriceSummary {
    let boxplot = five_number_summary(sorted);
    let stddev = stddev_about_median(sorted, boxplot[2]);

    let (window_price, support) = match estimator {
        Estimator::ClusterWindow => cluster_window(sorted, min_cluster_size),
        Estimator::StddevFilter => stddev_window(sorted),
        Estimator::MadFilter => mad_window(sorted),
    };

    PriceSummary {
        boxplot,
        stddev,
        window_price,
        confidence: (support as f64 / 10.0).min(1.0),
        num_listed: sorted.len(),
    }
}

/// min, q1, median, q3, max by index into the sorted vector.
pub fn five_number_summary(sorted: &[f64]) -> [f64; 5] {
    let n = sorted.len();
    [
        sorted[0],
        sorted[n / 4],
        sorted[n / 2],
        sorted[3 * n / 4],
        sorted[n - 1],
    ]
}

/// Population standard deviation about the median rather than the mean; the
/// median is the centrality statistic everywhere in this pipeline.
pub fn stddev_about_median(prices: &[f64], median: f64) -> f64 {
    let variance =
        prices.iter().map(|p| (p - median).powi(2)).sum::<f64>() / prices.len() as f64;
    variance.sqrt()
}

/// Window price via hierarchical clustering: cluster the bucket, keep the
/// clusters at the first non-empty size tier (`min_cluster_size`, then one
/// smaller, down to 1), and take the median of the cheapest surviving
/// cluster. Bait listings sit in small expensive clusters and lose.
fn cluster_window(sorted: &[f64], min_cluster_size: usize) -> (f64, usize) {
    let clusters = clustering::cluster_prices(sorted, Linkage::Complete);

    let mut tier = min_cluster_size.max(1);
    let mut inliers = loop {
        let candidates: Vec<&Vec<f64>> = clusters.iter().filter(|c| c.len() >= tier).collect();
        if !candidates.is_empty() || tier == 1 {
            break candidates;
        }
        tier -= 1;
    };

    inliers.sort_by(|a, b| {
        let min_a = a.iter().copied().fold(f64::INFINITY, f64::min);
        let min_b = b.iter().copied().fold(f64::INFINITY, f64::min);
        min_a.partial_cmp(&min_b).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut target = inliers[0].clone();
    target.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    (target[target.len() / 2], target.len())
}

/// Window price by filtering twice at two standard deviations about the
/// median, then taking the median of what is left.
fn stddev_window(sorted: &[f64]) -> (f64, usize) {
    let mut kept = sorted.to_vec();
    for _ in 0..2 {
        if kept.len() < 2 {
            break;
        }
        let median = kept[kept.len() / 2];
        let sd = stddev_about_median(&kept, median);
        if sd == 0.0 {
            break;
        }
        kept.retain(|p| (p - median).abs() <= 2.0 * sd);
    }
    (kept[kept.len() / 2], kept.len())
}

/// Window price by an asymmetric median-absolute-deviation fence: separate
/// MADs for the left and right tails, three MADs of slack each way.
fn mad_window(sorted: &[f64]) -> (f64, usize) {
    let median = sorted[sorted.len() / 2];

    let left_mad = tail_mad(sorted.iter().filter(|&&p| p < median).map(|p| median - p));
    let right_mad = tail_mad(sorted.iter().filter(|&&p| p > median).map(|p| p - median));

    let low = median - 3.0 * left_mad;
    let high = median + 3.0 * right_mad;
    let kept: Vec<f64> = sorted
        .iter()
        .copied()
        .filter(|&p| p >= low && p <= high)
        .collect();

    (kept[kept.len() / 2], kept.len())
}

/// Median of one tail's deviations; 0 for an empty tail.
fn tail_mad(deviations: impl Iterator<Item = f64>) -> f64 {
    let mut deviations: Vec<f64> = deviations.collect();
    if deviations.is_empty() {
        return 0.0;
    }
    deviations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    deviations[deviations.len() / 2]
}
